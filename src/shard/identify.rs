//! Global identify admission control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tracing::debug;

use crate::core::{ClientError, ClientResult, WindowLimiter};

/// Identify rate-limit key: one client identity and one concurrency bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IdentifyKey {
    pub identity: Arc<str>,
    pub bucket: u32,
}

impl IdentifyKey {
    pub fn for_shard(identity: Arc<str>, shard_id: u32, max_concurrency: u32) -> Self {
        Self {
            identity,
            bucket: shard_id % max_concurrency.max(1),
        }
    }
}

/// Hands out one identify token per key per interval.
///
/// Shared by every shard of an identity (and by every coordinator given the same `ActorRef`).
pub struct IdentifyLimiterActor {
    interval: Duration,
    buckets: HashMap<IdentifyKey, WindowLimiter>,
    granted: u64,
}

impl IdentifyLimiterActor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buckets: HashMap::new(),
            granted: 0,
        }
    }
}

impl Actor for IdentifyLimiterActor {
    type Args = Self;
    type Error = ClientError;

    fn name() -> &'static str {
        "IdentifyLimiterActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> ClientResult<Self> {
        Ok(args)
    }
}

/// Take the key's token, or fail with `ClientError::RateLimited` carrying the wait.
#[derive(Clone, Debug)]
pub struct AcquireIdentify {
    pub key: IdentifyKey,
}

impl KameoMessage<AcquireIdentify> for IdentifyLimiterActor {
    type Reply = ClientResult<()>;

    async fn handle(
        &mut self,
        msg: AcquireIdentify,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let interval = self.interval;
        let limiter = self
            .buckets
            .entry(msg.key.clone())
            .or_insert_with(|| WindowLimiter::new("identify", 1, interval));
        limiter.try_acquire()?;
        self.granted = self.granted.saturating_add(1);
        debug!(
            identity = %msg.key.identity,
            bucket = msg.key.bucket,
            granted = self.granted,
            "identify token granted"
        );
        Ok(())
    }
}

/// A shard's view of the identify limiter.
#[derive(Clone, Debug)]
pub struct IdentifyGate {
    limiter: ActorRef<IdentifyLimiterActor>,
    key: IdentifyKey,
}

impl IdentifyGate {
    pub fn new(limiter: ActorRef<IdentifyLimiterActor>, key: IdentifyKey) -> Self {
        Self { limiter, key }
    }

    pub fn key(&self) -> &IdentifyKey {
        &self.key
    }

    /// Wait until an identify token is granted.
    pub async fn acquire(&self) -> ClientResult<()> {
        loop {
            let request = AcquireIdentify {
                key: self.key.clone(),
            };
            match self.limiter.ask(request).await {
                Ok(()) => return Ok(()),
                Err(SendError::HandlerError(ClientError::RateLimited { retry_after, .. })) => {
                    tokio::time::sleep(retry_after.max(Duration::from_millis(1))).await;
                }
                Err(err) => return Err(ClientError::ActorError(err.to_string())),
            }
        }
    }
}
