use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        Message as TungsteniteMessage, Utf8Bytes,
        protocol::{CloseFrame as TungCloseFrame, WebSocketConfig},
    },
};

use super::{GatewayTransport, TransportConnectFuture};
use crate::core::{ClientError, WsCloseFrame, WsFrame};
use crate::tls::install_rustls_crypto_provider;

const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 << 20;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn transport_error(context: &'static str, err: impl ToString) -> ClientError {
    ClientError::Transport {
        context,
        error: err.to_string(),
    }
}

fn close_to_core(frame: Option<TungCloseFrame>) -> Option<WsCloseFrame> {
    frame.map(|f| WsCloseFrame {
        code: u16::from(f.code),
        reason: AsRef::<Bytes>::as_ref(&f.reason).clone(),
    })
}

fn core_to_close(frame: WsCloseFrame) -> TungCloseFrame {
    TungCloseFrame {
        code: frame.code.into(),
        reason: Utf8Bytes::try_from(frame.reason).unwrap_or_else(|_| Utf8Bytes::from_static("")),
    }
}

fn msg_to_frame(msg: TungsteniteMessage) -> Option<WsFrame> {
    match msg {
        TungsteniteMessage::Text(text) => {
            Some(WsFrame::Text(AsRef::<Bytes>::as_ref(&text).clone()))
        }
        TungsteniteMessage::Binary(bytes) => Some(WsFrame::Binary(bytes)),
        TungsteniteMessage::Ping(bytes) => Some(WsFrame::Ping(bytes)),
        TungsteniteMessage::Pong(bytes) => Some(WsFrame::Pong(bytes)),
        TungsteniteMessage::Close(frame) => Some(WsFrame::Close(close_to_core(frame))),
        // Raw frames never surface while reading.
        TungsteniteMessage::Frame(_) => None,
    }
}

fn frame_to_msg(frame: WsFrame) -> TungsteniteMessage {
    match frame {
        WsFrame::Text(bytes) => match Utf8Bytes::try_from(bytes.clone()) {
            Ok(text) => TungsteniteMessage::Text(text),
            Err(_) => TungsteniteMessage::Binary(bytes),
        },
        WsFrame::Binary(bytes) => TungsteniteMessage::Binary(bytes),
        WsFrame::Ping(bytes) => TungsteniteMessage::Ping(bytes),
        WsFrame::Pong(bytes) => TungsteniteMessage::Pong(bytes),
        WsFrame::Close(frame) => TungsteniteMessage::Close(frame.map(core_to_close)),
    }
}

/// `tokio-tungstenite` gateway transport over rustls.
#[derive(Clone)]
pub struct TungsteniteTransport {
    connector: Option<Connector>,
    max_message_bytes: usize,
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self {
            connector: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a caller-built rustls configuration instead of the bundled webpki roots.
    pub fn with_rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            connector: Some(Connector::Rustls(config)),
            ..Self::default()
        }
    }

    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes.max(1024);
        self
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<Socket>,
}

impl Stream for TungsteniteReader {
    type Item = Result<WsFrame, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg_to_frame(msg) {
                    Some(frame) => Poll::Ready(Some(Ok(frame))),
                    None => continue,
                },
                Poll::Ready(Some(Err(err))) => {
                    Poll::Ready(Some(Err(transport_error("read", err))))
                }
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<Socket, TungsteniteMessage>,
}

impl Sink<WsFrame> for TungsteniteWriter {
    type Error = ClientError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| transport_error("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(frame_to_msg(item))
            .map_err(|e| transport_error("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| transport_error("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| transport_error("close", e))
    }
}

impl GatewayTransport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let connector = self.connector.clone();
        let max_message_bytes = self.max_message_bytes;
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut config = WebSocketConfig::default();
            config.max_message_size = Some(max_message_bytes);
            config.max_frame_size = Some(max_message_bytes);

            let (stream, _) = connect_async_tls_with_config(url, Some(config), false, connector)
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?;

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader { inner: read },
                TungsteniteWriter { inner: write },
            ))
        })
    }
}
