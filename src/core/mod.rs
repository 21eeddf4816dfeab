pub mod circular_buffer;
pub mod close_code;
pub mod config;
pub mod frame;
pub mod health;
pub mod heartbeat;
pub mod inflate;
pub mod rate_limit;
pub mod reconnect;
pub mod types;

pub use close_code::{CloseAction, CloseCode, classify_close};
pub use config::{ClientConfig, FatalRestartPolicy};
pub use frame::{WsCloseFrame, WsFrame};
pub use health::SessionHealth;
pub use heartbeat::{HeartbeatTick, HeartbeatTracker};
pub use inflate::{Compression, Inflater};
pub use rate_limit::WindowLimiter;
pub use reconnect::{ExponentialBackoff, jitter_delay};
pub use types::*;
