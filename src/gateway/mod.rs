pub mod adapter;
pub mod events;
pub mod protocol;
pub mod session;
pub mod writer;

pub use adapter::{TransportAdapter, TransportEnvelope, TransportEvent};
pub use events::{EventHub, GatewayEvent, LifecycleKind, ShardLifecycle, broadcast_stream};
pub use protocol::{GatewayMessage, OpCode, ReadyInfo};
pub use session::{
    FatalCause, GetFatalCause, GetSessionState, GetSessionStats, Restart, SendCommand,
    ShardSession, ShardSessionArgs, Shutdown, Start,
};
pub use writer::{FrameWriter, WriteFrame};
