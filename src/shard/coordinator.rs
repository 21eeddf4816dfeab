//! Shard Coordinator: a fixed pool of shard sessions sharing one identify budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use kameo::prelude::{Actor, ActorRef};
use parking_lot::Mutex;
use sonic_rs::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::identify::{IdentifyGate, IdentifyKey, IdentifyLimiterActor};
use crate::core::types::flatten_ask;
use crate::core::{
    ClientConfig, ClientError, ClientResult, FatalRestartPolicy, SessionState, SessionStats,
    ShardInfo,
};
use crate::gateway::events::{
    EventHub, GatewayEvent, LifecycleKind, ShardLifecycle, broadcast_stream,
};
use crate::gateway::session::{
    GetFatalCause, GetSessionState, GetSessionStats, Restart, SendCommand, ShardSession,
    ShardSessionArgs, Shutdown, Start,
};
use crate::transport::GatewayTransport;

pub struct ShardCoordinator<T: GatewayTransport> {
    config: Arc<ClientConfig>,
    hub: EventHub,
    identify: ActorRef<IdentifyLimiterActor>,
    shards: Vec<ActorRef<ShardSession<T>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: GatewayTransport> ShardCoordinator<T> {
    /// Spawn one session actor per shard. Must run inside a tokio runtime.
    pub fn new(config: Arc<ClientConfig>, transport: T) -> Self {
        let limiter = IdentifyLimiterActor::spawn(IdentifyLimiterActor::new(
            config.identify_interval(),
        ));
        Self::with_identify_limiter(config, transport, limiter)
    }

    /// Share an identify limiter with other coordinators of the same identity.
    pub fn with_identify_limiter(
        config: Arc<ClientConfig>,
        transport: T,
        identify: ActorRef<IdentifyLimiterActor>,
    ) -> Self {
        let hub = EventHub::new(config.event_buffer);
        let identity = identity_label(&config);
        let shards = (0..config.shard_count)
            .map(|id| {
                let key = IdentifyKey::for_shard(
                    identity.clone(),
                    id,
                    config.identify_max_concurrency,
                );
                ShardSession::spawn(ShardSessionArgs {
                    shard: ShardInfo::new(id, config.shard_count),
                    config: config.clone(),
                    transport: transport.clone(),
                    identify: IdentifyGate::new(identify.clone(), key),
                    hub: hub.clone(),
                })
            })
            .collect();

        Self {
            config,
            hub,
            identify,
            shards,
            supervisor: Mutex::new(None),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn identify_limiter(&self) -> &ActorRef<IdentifyLimiterActor> {
        &self.identify
    }

    pub fn shard(&self, shard_id: u32) -> Option<&ActorRef<ShardSession<T>>> {
        self.shards.get(shard_id as usize)
    }

    /// Shard that receives events for a guild.
    pub fn shard_for_guild(&self, guild_id: u64) -> u32 {
        ShardInfo::for_resource(guild_id, self.shard_count())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.hub.subscribe()
    }

    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<ShardLifecycle> {
        self.hub.subscribe_lifecycle()
    }

    /// Every application event from every shard, in per-shard server order.
    pub fn events(&self) -> impl Stream<Item = GatewayEvent> + Send + Unpin + use<T> {
        broadcast_stream(self.hub.subscribe())
    }

    pub fn lifecycle(&self) -> impl Stream<Item = ShardLifecycle> + Send + Unpin + use<T> {
        broadcast_stream(self.hub.subscribe_lifecycle())
    }

    /// Start every shard. Identify admission spaces their handshakes.
    pub async fn start(&self) -> ClientResult<()> {
        self.spawn_supervisor();
        info!(shards = self.shards.len(), "starting shard pool");
        for shard in &self.shards {
            shard
                .tell(Start)
                .send()
                .await
                .map_err(|err| ClientError::ActorError(err.to_string()))?;
        }
        Ok(())
    }

    pub async fn restart_shard(&self, shard_id: u32) -> ClientResult<()> {
        self.shard_ref(shard_id)?
            .tell(Restart)
            .send()
            .await
            .map_err(|err| ClientError::ActorError(err.to_string()))
    }

    pub async fn send_command(&self, shard_id: u32, op: u8, data: Value) -> ClientResult<()> {
        flatten_ask(self.shard_ref(shard_id)?.ask(SendCommand { op, data }).await)
    }

    pub async fn session_state(&self, shard_id: u32) -> ClientResult<SessionState> {
        flatten_ask(self.shard_ref(shard_id)?.ask(GetSessionState).await)
    }

    pub async fn session_stats(&self, shard_id: u32) -> ClientResult<SessionStats> {
        flatten_ask(self.shard_ref(shard_id)?.ask(GetSessionStats).await)
    }

    /// Close every shard and stop their actors.
    pub async fn shutdown(&self) -> ClientResult<()> {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        for shard in &self.shards {
            if let Err(err) = flatten_ask(shard.ask(Shutdown).await) {
                warn!(error = %err, "shard did not acknowledge shutdown");
            }
            let _ = shard.stop_gracefully().await;
            shard.wait_for_shutdown().await;
        }
        info!("shard pool stopped");
        Ok(())
    }

    fn shard_ref(&self, shard_id: u32) -> ClientResult<&ActorRef<ShardSession<T>>> {
        self.shard(shard_id).ok_or_else(|| {
            ClientError::InvalidState(format!(
                "shard {shard_id} out of range (count {})",
                self.shards.len()
            ))
        })
    }

    /// Watch lifecycle notices and apply the fatal-restart policy.
    fn spawn_supervisor(&self) {
        let mut guard = self.supervisor.lock();
        if guard.is_some() {
            return;
        }
        let lifecycle = self.hub.subscribe_lifecycle();
        *guard = Some(tokio::spawn(self.fatal_supervisor().run(lifecycle)));
    }

    fn fatal_supervisor(&self) -> FatalSupervisor<T> {
        FatalSupervisor {
            policy: self.config.fatal_restart,
            cooldown: self.config.fatal_restart_cooldown(),
            shards: self.shards.clone(),
            restarting: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

/// Applies the fatal-restart policy to lifecycle notices.
struct FatalSupervisor<T: GatewayTransport> {
    policy: FatalRestartPolicy,
    cooldown: Duration,
    shards: Vec<ActorRef<ShardSession<T>>>,
    /// Shards with a restart already scheduled.
    restarting: Arc<Mutex<HashSet<u32>>>,
}

impl<T: GatewayTransport> FatalSupervisor<T> {
    async fn run(self, mut lifecycle: broadcast::Receiver<ShardLifecycle>) {
        loop {
            match lifecycle.recv().await {
                Ok(ShardLifecycle {
                    shard_id,
                    kind:
                        LifecycleKind::Fatal {
                            reason,
                            authentication,
                        },
                }) => self.on_fatal(shard_id, &reason, authentication),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "shard supervisor lagged behind lifecycle notices");
                    self.rescan().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn on_fatal(&self, shard_id: u32, reason: &str, authentication: bool) {
        if authentication || self.policy == FatalRestartPolicy::Surface {
            error!(
                shard = shard_id,
                authentication,
                reason = %reason,
                "shard stopped; not restarting"
            );
            return;
        }
        let Some(shard) = self.shards.get(shard_id as usize).cloned() else {
            return;
        };
        if !self.restarting.lock().insert(shard_id) {
            return;
        }

        warn!(
            shard = shard_id,
            cooldown_ms = self.cooldown.as_millis() as u64,
            reason = %reason,
            "restarting fatal shard after cooldown"
        );
        let cooldown = self.cooldown;
        let restarting = self.restarting.clone();
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            let _ = shard.tell(Restart).send().await;
            restarting.lock().remove(&shard_id);
        });
    }

    /// Notices were dropped; ask every shard directly whether it is stuck in `Fatal`.
    async fn rescan(&self) {
        if self.policy == FatalRestartPolicy::Surface {
            return;
        }
        for (shard_id, shard) in self.shards.iter().enumerate() {
            let shard_id = shard_id as u32;
            if self.restarting.lock().contains(&shard_id) {
                continue;
            }
            match flatten_ask(shard.ask(GetFatalCause).await) {
                Ok(Some(cause)) => self.on_fatal(shard_id, &cause.reason, cause.authentication),
                Ok(None) => {}
                Err(err) => warn!(shard = shard_id, error = %err, "shard state unavailable"),
            }
        }
    }
}

impl<T: GatewayTransport> Drop for ShardCoordinator<T> {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
    }
}

/// Non-secret label for the identity behind a token: its first dot-separated segment.
fn identity_label(config: &ClientConfig) -> Arc<str> {
    let token = config.bare_token();
    let label = token.split('.').next().filter(|s| !s.is_empty()).unwrap_or("default");
    Arc::from(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tokio::time::{Instant, timeout};

    #[test]
    fn identity_label_never_exposes_the_secret_part() {
        let config = ClientConfig::new("Bot MTIz.abc.secret");
        assert_eq!(&*identity_label(&config), "MTIz");
        let bare = ClientConfig::new("plain");
        assert_eq!(&*identity_label(&bare), "plain");
    }

    #[tokio::test(start_paused = true)]
    async fn rescan_restarts_a_fatal_shard_once() {
        let mut config = ClientConfig::new("app.secret.token");
        config.gateway_url = "ws://gateway.test".to_string();
        config.fatal_restart = FatalRestartPolicy::Restart;
        config.fatal_restart_cooldown_ms = 2_000;
        let (transport, mut gateway) = MockTransport::new();
        let coordinator = ShardCoordinator::new(Arc::new(config), transport);
        // no notice-driven supervisor: every lifecycle notice goes unseen
        coordinator.shards[0].tell(Start).send().await.expect("start");

        let mut conn = gateway.accept().await.expect("connection");
        conn.hello(Duration::from_secs(40)).expect("hello");
        conn.recv_op(2).await.expect("identify");
        conn.close(4014, "Disallowed intent(s).").expect("close");
        while coordinator.session_state(0).await.expect("state") != SessionState::Fatal {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let supervisor = coordinator.fatal_supervisor();
        let rescanned_at = Instant::now();
        supervisor.rescan().await;
        supervisor.rescan().await;

        let _restarted = timeout(Duration::from_secs(30), gateway.accept())
            .await
            .expect("restart in time")
            .expect("gateway open");
        assert!(Instant::now() >= rescanned_at + Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(gateway.connect_count(), 2);

        coordinator.shutdown().await.expect("shutdown");
    }
}
