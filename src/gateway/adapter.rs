//! Transport Adapter: one gateway socket at a time, surfaced as four inbound events.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{Sink, StreamExt};
use kameo::prelude::{Actor, ActorRef};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::writer::{FrameWriter, WriteFrame};
use crate::core::{ClientError, ClientResult, Compression, Inflater, WsFrame};
use crate::transport::GatewayTransport;

/// Inbound transport events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Opened,
    /// A complete, decoded (and inflated) text payload.
    MessageReceived(String),
    Closed { code: Option<u16>, reason: String },
    /// Connect failure, read failure or undecodable payload.
    TransportError(String),
}

/// An event tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    pub connection: u64,
    pub event: TransportEvent,
}

type WriterSlot<W> = Arc<Mutex<Option<ActorRef<FrameWriter<W>>>>>;

struct ActiveConnection<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Unpin + 'static,
{
    id: u64,
    writer: WriterSlot<W>,
    finished: Arc<AtomicBool>,
    close_tx: oneshot::Sender<WsFrame>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns at most one live connection. Dropping the adapter closes it.
pub struct TransportAdapter<T: GatewayTransport> {
    transport: T,
    compression: Compression,
    events_tx: mpsc::UnboundedSender<TransportEnvelope>,
    next_connection: u64,
    current: Option<ActiveConnection<T::Writer>>,
}

impl<T: GatewayTransport> TransportAdapter<T> {
    pub fn new(
        transport: T,
        compression: Compression,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEnvelope>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                compression,
                events_tx,
                next_connection: 0,
                current: None,
            },
            events_rx,
        )
    }

    /// Start connecting to `url` and return the connection handle.
    ///
    /// Returns the existing handle while a connection is pending or open. Connect failures
    /// arrive as `TransportEvent::TransportError` on the event channel.
    pub fn open(&mut self, url: &str) -> u64 {
        if let Some(current) = self.current.as_ref() {
            if !current.finished.load(Ordering::Acquire) {
                return current.id;
            }
        }
        self.close(1000, "superseded");

        self.next_connection = self.next_connection.wrapping_add(1);
        let id = self.next_connection;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (close_tx, close_rx) = oneshot::channel();
        let writer: WriterSlot<T::Writer> = Arc::new(Mutex::new(None));
        let finished = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_connection(
            self.transport.clone(),
            url.to_string(),
            id,
            self.compression,
            self.events_tx.clone(),
            writer.clone(),
            finished.clone(),
            shutdown_rx,
            close_rx,
        ));

        debug!(connection = id, url, "opening gateway transport");
        self.current = Some(ActiveConnection {
            id,
            writer,
            finished,
            close_tx,
            shutdown_tx,
            task,
        });
        id
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.id)
    }

    /// A connection is pending or open and has not reported a terminal event.
    pub fn is_live(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| !c.finished.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.writer.lock().is_some())
    }

    /// Queue a frame on the open connection.
    ///
    /// The writer is resolved before the returned future is polled, so the future does not
    /// borrow the adapter.
    pub fn send(&self, frame: WsFrame) -> impl Future<Output = ClientResult<()>> + Send + 'static {
        let writer = self
            .current
            .as_ref()
            .and_then(|c| c.writer.lock().clone())
            .ok_or_else(|| ClientError::Send("transport is not open".to_string()));
        async move {
            writer?
                .tell(WriteFrame { frame })
                .send()
                .await
                .map_err(|err| ClientError::Send(err.to_string()))
        }
    }

    /// Close the current connection, if any. Idempotent; no events follow for it.
    ///
    /// The connection task writes the close frame before it stops the writer. A connection
    /// that is still handshaking is abandoned without one.
    pub fn close(&mut self, code: u16, reason: &str) {
        let Some(current) = self.current.take() else {
            return;
        };
        let _ = current.close_tx.send(WsFrame::close(code, reason));
        let _ = current.shutdown_tx.send(true);
        if current.finished.load(Ordering::Acquire) {
            current.task.abort();
        }
        debug!(connection = current.id, code, reason, "closed gateway transport");
    }
}

impl<T: GatewayTransport> Drop for TransportAdapter<T> {
    fn drop(&mut self) {
        self.close(1000, "shutdown");
    }
}

fn emit(
    events: &mpsc::UnboundedSender<TransportEnvelope>,
    connection: u64,
    event: TransportEvent,
) -> bool {
    events.send(TransportEnvelope { connection, event }).is_ok()
}

async fn run_connection<T: GatewayTransport>(
    transport: T,
    url: String,
    id: u64,
    compression: Compression,
    events: mpsc::UnboundedSender<TransportEnvelope>,
    writer_slot: WriterSlot<T::Writer>,
    finished: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
    mut close_rx: oneshot::Receiver<WsFrame>,
) {
    // Terminal events are emitted only after the connection is marked finished.
    let terminal = |event: TransportEvent| {
        finished.store(true, Ordering::Release);
        emit(&events, id, event)
    };

    let connected = tokio::select! {
        _ = shutdown_rx.changed() => return,
        result = transport.connect(url.clone()) => result,
    };
    let (mut reader, writer) = match connected {
        Ok(pair) => pair,
        Err(err) => {
            warn!(connection = id, url = %url, error = %err, "gateway connect failed");
            terminal(TransportEvent::TransportError(err.to_string()));
            return;
        }
    };
    let writer = FrameWriter::spawn(FrameWriter::new(writer, shutdown_rx.clone()));
    if *shutdown_rx.borrow_and_update() {
        write_close_and_stop(id, writer, &mut close_rx).await;
        return;
    }
    *writer_slot.lock() = Some(writer.clone());
    info!(connection = id, url = %url, "gateway transport open");
    if !emit(&events, id, TransportEvent::Opened) {
        writer_slot.lock().take();
        let _ = writer.stop_gracefully().await;
        return;
    }

    let mut inflater = Inflater::new(compression);
    let closed_locally = loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow_and_update() { break true; }
            }
            frame = reader.next() => {
                let event = match frame {
                    Some(Ok(WsFrame::Close(close))) => {
                        let (code, reason) = match close {
                            Some(close) => (Some(close.code), close.reason_lossy()),
                            None => (None, String::new()),
                        };
                        info!(connection = id, code, reason = %reason, "received websocket close frame");
                        terminal(TransportEvent::Closed { code, reason });
                        break false;
                    }
                    Some(Ok(WsFrame::Ping(payload))) => {
                        let _ = writer.tell(WriteFrame { frame: WsFrame::Pong(payload) }).send().await;
                        continue;
                    }
                    Some(Ok(WsFrame::Pong(_))) => continue,
                    Some(Ok(frame)) => match inflater.push(&frame) {
                        Ok(Some(text)) => TransportEvent::MessageReceived(text),
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(connection = id, error = %err, "failed to decode gateway payload");
                            TransportEvent::TransportError(err.to_string())
                        }
                    },
                    Some(Err(err)) => {
                        terminal(TransportEvent::TransportError(err.to_string()));
                        break false;
                    }
                    None => {
                        terminal(TransportEvent::Closed { code: None, reason: "stream ended".to_string() });
                        break false;
                    }
                };
                if !emit(&events, id, event) {
                    break false;
                }
            }
        }
    };

    writer_slot.lock().take();
    if closed_locally {
        write_close_and_stop(id, writer, &mut close_rx).await;
    } else {
        let _ = writer.stop_gracefully().await;
    }
}

/// Deliver the locally requested close frame, then stop the writer once it is on the wire.
async fn write_close_and_stop<W>(
    id: u64,
    writer: ActorRef<FrameWriter<W>>,
    close_rx: &mut oneshot::Receiver<WsFrame>,
) where
    W: Sink<WsFrame, Error = ClientError> + Send + Unpin + 'static,
{
    if let Ok(frame) = close_rx.try_recv() {
        if let Err(err) = writer.ask(WriteFrame { frame }).await {
            debug!(connection = id, error = %err, "close frame not delivered");
        }
    }
    let _ = writer.stop_gracefully().await;
    writer.wait_for_shutdown().await;
}
