pub mod coordinator;
pub mod identify;

pub use coordinator::ShardCoordinator;
pub use identify::{AcquireIdentify, IdentifyGate, IdentifyKey, IdentifyLimiterActor};
