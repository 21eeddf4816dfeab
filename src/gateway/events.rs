use std::time::Duration;

use futures_util::Stream;
use sonic_rs::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// One application event, in server order per shard.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub shard_id: u32,
    /// Dispatch name, e.g. `MESSAGE_CREATE`.
    pub kind: String,
    pub sequence: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleKind {
    Connected,
    Ready { session_id: String },
    Resumed,
    Disconnected { code: Option<u16>, reason: String },
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The shard stopped; `authentication` marks rejected credentials.
    Fatal { reason: String, authentication: bool },
}

/// Observability notice about a shard's connection lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardLifecycle {
    pub shard_id: u32,
    pub kind: LifecycleKind,
}

/// Broadcast fan-out shared by every shard of one client. Each subscriber sees every item.
#[derive(Clone)]
pub struct EventHub {
    events: broadcast::Sender<GatewayEvent>,
    lifecycle: broadcast::Sender<ShardLifecycle>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (lifecycle, _) = broadcast::channel(capacity);
        Self { events, lifecycle }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ShardLifecycle> {
        self.lifecycle.subscribe()
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: GatewayEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub fn notify(&self, shard_id: u32, kind: LifecycleKind) {
        let _ = self.lifecycle.send(ShardLifecycle { shard_id, kind });
    }
}

/// Adapt a broadcast receiver into a stream that ends when every sender is gone.
///
/// A lagging subscriber skips the overwritten items and keeps going.
pub fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> impl Stream<Item = T> + Send + Unpin
where
    T: Clone + Send + 'static,
{
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; items dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn event(sequence: u64) -> GatewayEvent {
        GatewayEvent {
            shard_id: 0,
            kind: "TEST".to_string(),
            sequence,
            payload: Value::default(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let hub = EventHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.publish(event(1)), 2);
        assert_eq!(a.recv().await.unwrap().sequence, 1);
        assert_eq!(b.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn stream_skips_lag_and_ends_with_the_hub() {
        let hub = EventHub::new(2);
        let stream = broadcast_stream(hub.subscribe());
        for seq in 1..=4 {
            hub.publish(event(seq));
        }
        drop(hub);

        let seen: Vec<u64> = stream.map(|e| e.sequence).collect().await;
        assert_eq!(seen, vec![3, 4]);
    }
}
