use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tokio::sync::watch;
use tracing::debug;

use crate::core::{ClientError, ClientResult, WsFrame};

/// Owns the socket's write half and serializes every outbound frame of one connection.
pub struct FrameWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
    frames_sent: u64,
}

impl<W> FrameWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Unpin + 'static,
{
    pub fn new(writer: W, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            writer,
            shutdown_rx,
            frames_sent: 0,
        }
    }
}

impl<W> Actor for FrameWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Unpin + 'static,
{
    type Args = Self;
    type Error = ClientError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> Result<(), Self::Error> {
        debug!(
            target: "gateway-writer",
            frames_sent = self.frames_sent,
            "closing websocket write half"
        );
        let _ = self.writer.close().await;
        Ok(())
    }
}

pub struct WriteFrame {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriteFrame> for FrameWriter<W>
where
    W: Sink<WsFrame, Error = ClientError> + Send + Unpin + 'static,
{
    type Reply = ClientResult<()>;

    async fn handle(&mut self, msg: WriteFrame, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let closing = matches!(msg.frame, WsFrame::Close(_));
        if *self.shutdown_rx.borrow() && !closing {
            return Err(ClientError::InvalidState("writer stopped".to_string()));
        }
        debug!(target: "gateway-writer", closing, "sending websocket frame to wire");
        self.writer.send(msg.frame).await?;
        self.frames_sent = self.frames_sent.saturating_add(1);
        Ok(())
    }
}
