//! Sharded gateway sessions and a rate-limit aware REST dispatcher, built on kameo actors.

pub mod client;
pub mod core;
pub mod gateway;
pub mod rest;
pub mod shard;
pub mod testing;
pub mod tls;
pub mod transport;

pub use client::Client;
pub use crate::core::{ClientConfig, ClientError, ClientResult, Compression, SessionState, SessionStats};
pub use gateway::{GatewayEvent, LifecycleKind, ShardLifecycle};
pub use rest::{RequestDispatcher, RestRequest, RestResponse, RouteSignature};
pub use shard::ShardCoordinator;
pub use transport::{GatewayTransport, TungsteniteTransport};
