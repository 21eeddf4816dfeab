//! In-memory gateway and HTTP doubles for driving shards and the dispatcher without sockets.
//!
//! [`MockTransport::new`] returns the transport to hand to a shard plus a [`MockGateway`]
//! that accepts each connection attempt as a [`MockConnection`]. Tests read what the
//! client wrote, push server frames, and drop sockets through that handle.
//! [`MockHttpExecutor`] answers REST calls from a script and records when each call hit it.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use http::StatusCode;
use parking_lot::Mutex;
use sonic_rs::{JsonValueTrait, Value};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::core::{ClientError, ClientResult, WsFrame};
use crate::rest::http::{HttpExecutor, HttpFuture, RestRequest, RestResponse};
use crate::transport::{GatewayTransport, TransportConnectFuture};

struct MockShared {
    accepted: mpsc::UnboundedSender<MockConnection>,
    refuse: AtomicUsize,
    connects: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

/// Transport whose connections terminate in a [`MockGateway`].
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn new() -> (Self, MockGateway) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            accepted,
            refuse: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        (
            Self {
                shared: shared.clone(),
            },
            MockGateway { incoming, shared },
        )
    }
}

impl GatewayTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(&self, url: String) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = self.shared.clone();
        Box::pin(async move {
            shared.connects.fetch_add(1, Ordering::AcqRel);
            shared.urls.lock().push(url.clone());

            let refused = shared
                .refuse
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(ClientError::Connection(format!("mock refused {url}")));
            }

            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            shared
                .accepted
                .send(MockConnection {
                    url,
                    inbound_tx: Some(inbound_tx),
                    outbound_rx,
                })
                .map_err(|_| ClientError::Connection("mock gateway dropped".to_string()))?;
            Ok((MockReader { rx: inbound_rx }, MockWriter { tx: outbound_tx }))
        })
    }
}

/// Server side of [`MockTransport`]: one [`MockConnection`] per accepted connect.
pub struct MockGateway {
    incoming: mpsc::UnboundedReceiver<MockConnection>,
    shared: Arc<MockShared>,
}

impl MockGateway {
    /// Next accepted connection. Waits as long as it takes.
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.incoming.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.incoming.recv())
            .await
            .unwrap_or_default()
    }

    /// Fail the next `count` connect attempts with `ClientError::Connection`.
    pub fn refuse_next(&self, count: usize) {
        self.shared.refuse.fetch_add(count, Ordering::AcqRel);
    }

    /// Connect attempts seen so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::Acquire)
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.shared.urls.lock().clone()
    }
}

/// Error surface for operations on [`MockConnection`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockConnectionError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The client side stopped reading.
    ChannelClosed,
}

impl std::fmt::Display for MockConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockConnectionError::SocketDropped => f.write_str("mock socket already dropped"),
            MockConnectionError::ChannelClosed => f.write_str("mock client channel is closed"),
        }
    }
}

impl std::error::Error for MockConnectionError {}

/// One accepted connection, seen from the server.
pub struct MockConnection {
    url: String,
    inbound_tx: Option<mpsc::UnboundedSender<WsFrame>>,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl MockConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn send_frame(&self, frame: WsFrame) -> Result<(), MockConnectionError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockConnectionError::SocketDropped);
        };
        tx.send(frame).map_err(|_| MockConnectionError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<(), MockConnectionError> {
        self.send_frame(WsFrame::text(text.as_ref().to_owned()))
    }

    pub fn send_binary(&self, bytes: Vec<u8>) -> Result<(), MockConnectionError> {
        self.send_frame(WsFrame::binary(bytes))
    }

    /// `HELLO` with the given heartbeat interval.
    pub fn hello(&self, heartbeat_interval: Duration) -> Result<(), MockConnectionError> {
        self.send_text(format!(
            r#"{{"op":10,"d":{{"heartbeat_interval":{}}}}}"#,
            heartbeat_interval.as_millis()
        ))
    }

    /// A dispatch envelope with raw JSON data.
    pub fn dispatch(&self, kind: &str, sequence: u64, data: &str) -> Result<(), MockConnectionError> {
        self.send_text(format!(
            r#"{{"op":0,"t":"{kind}","s":{sequence},"d":{data}}}"#
        ))
    }

    pub fn ready(&self, session_id: &str, sequence: u64) -> Result<(), MockConnectionError> {
        self.dispatch(
            "READY",
            sequence,
            &format!(r#"{{"session_id":"{session_id}","resume_gateway_url":"ws://resume.gateway"}}"#),
        )
    }

    pub fn heartbeat_ack(&self) -> Result<(), MockConnectionError> {
        self.send_text(r#"{"op":11}"#)
    }

    /// Server-initiated close with a code.
    pub fn close(&self, code: u16, reason: &str) -> Result<(), MockConnectionError> {
        self.send_frame(WsFrame::close(code, reason))
    }

    /// Drop the socket without a close frame.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    pub async fn recv_outbound(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next outbound text frame parsed as JSON. Other frames are skipped.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let frame = self.outbound_rx.recv().await?;
            if let Some(text) = frame.as_text() {
                if let Ok(value) = sonic_rs::from_str::<Value>(text) {
                    return Some(value);
                }
            }
        }
    }

    /// Next outbound payload with opcode `op`, skipping everything else (heartbeats included).
    pub async fn recv_op(&mut self, op: u64) -> Option<Value> {
        loop {
            let value = self.recv_json().await?;
            if value.get("op").and_then(|v| v.as_u64()) == Some(op) {
                return Some(value);
            }
        }
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<WsFrame>,
}

impl futures_util::Stream for MockReader {
    type Item = ClientResult<WsFrame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = ClientError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .tx
            .send(item)
            .map_err(|_| ClientError::Transport {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

enum Scripted {
    Reply(Duration, RestResponse),
    Fail(Duration, String),
}

/// A call as the mock executor saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub at: Instant,
    pub request: RestRequest,
}

#[derive(Default)]
struct MockHttpInner {
    script: Mutex<VecDeque<Scripted>>,
    by_path: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
    notify: Notify,
}

/// Scripted [`HttpExecutor`]. Path-specific replies win over the shared queue; with both
/// empty every call gets `200 {}`.
#[derive(Clone, Default)]
pub struct MockHttpExecutor {
    inner: Arc<MockHttpInner>,
}

impl MockHttpExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, response: RestResponse) {
        self.inner
            .script
            .lock()
            .push_back(Scripted::Reply(Duration::ZERO, response));
    }

    /// Reply after the call has been in flight for `delay`.
    pub fn reply_after(&self, delay: Duration, response: RestResponse) {
        self.inner
            .script
            .lock()
            .push_back(Scripted::Reply(delay, response));
    }

    /// Fail the next call with a transport error.
    pub fn fail(&self, error: &str) {
        self.inner
            .script
            .lock()
            .push_back(Scripted::Fail(Duration::ZERO, error.to_string()));
    }

    pub fn reply_for(&self, path: &str, response: RestResponse) {
        self.reply_for_after(path, Duration::ZERO, response);
    }

    pub fn reply_for_after(&self, path: &str, delay: Duration, response: RestResponse) {
        self.inner
            .by_path
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(Scripted::Reply(delay, response));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.calls.lock().clone()
    }

    pub fn calls_for(&self, path: &str) -> Vec<RecordedCall> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| call.request.path == path)
            .cloned()
            .collect()
    }

    /// Resolve once at least `count` calls have arrived.
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.calls.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }

    fn next_step(&self, path: &str) -> Option<Scripted> {
        if let Some(step) = self
            .inner
            .by_path
            .lock()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
        {
            return Some(step);
        }
        self.inner.script.lock().pop_front()
    }
}

impl HttpExecutor for MockHttpExecutor {
    fn execute(&self, request: RestRequest) -> HttpFuture {
        let step = self.next_step(&request.path);
        self.inner.calls.lock().push(RecordedCall {
            at: Instant::now(),
            request,
        });
        self.inner.notify.notify_waiters();

        Box::pin(async move {
            match step {
                Some(Scripted::Reply(delay, response)) => {
                    tokio::time::sleep(delay).await;
                    Ok(response)
                }
                Some(Scripted::Fail(delay, error)) => {
                    tokio::time::sleep(delay).await;
                    Err(ClientError::Transport {
                        context: "mock_http",
                        error,
                    })
                }
                None => Ok(RestResponse::new(StatusCode::OK, "{}")),
            }
        })
    }
}
