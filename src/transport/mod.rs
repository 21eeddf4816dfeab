use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{ClientResult, WsFrame};

pub mod tungstenite;

pub use tungstenite::TungsteniteTransport;

pub type TransportConnectFuture<R, W> = Pin<Box<dyn Future<Output = ClientResult<(R, W)>> + Send>>;

/// Connection factory for gateway sockets.
///
/// Implementations only move frames; compression, protocol and reconnect policy live above
/// this boundary, so a socket library (or an in-memory mock) can be swapped freely.
pub trait GatewayTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = ClientResult<WsFrame>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = crate::core::ClientError> + Send + Unpin + 'static;

    /// Open one connection. Fails with `ClientError::Connection` on DNS, TLS or refusal.
    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer>;
}
