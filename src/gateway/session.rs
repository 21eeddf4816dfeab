//! Session State Machine: one gateway session per shard, driven as a kameo actor.
//!
//! Socket IO, heartbeat timers, identify waits and reconnect delays all run in spawned tasks
//! that report back through `tell`; the actor owns every piece of session state.

use std::sync::Arc;
use std::time::Duration;

use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use sonic_rs::Value;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::adapter::{TransportAdapter, TransportEnvelope, TransportEvent};
use super::events::{EventHub, GatewayEvent, LifecycleKind};
use super::protocol::{
    GatewayMessage, OpCode, ReadyInfo, command_payload, gateway_url, heartbeat_payload,
    identify_payload, parse_message, resume_payload,
};
use crate::core::{
    CloseAction, ClientConfig, ClientError, ClientResult, ExponentialBackoff, HeartbeatTick,
    HeartbeatTracker, ReconnectStrategy, SessionHealth, SessionState, SessionStats, ShardInfo,
    WindowLimiter, WsFrame, classify_close, jitter_delay,
};
use crate::shard::identify::IdentifyGate;
use crate::transport::GatewayTransport;

/// Close code used when this side drops a connection it wants to resume.
const RESUME_CLOSE_CODE: u16 = 4000;
const COMMAND_WINDOW: Duration = Duration::from_secs(60);

pub struct ShardSessionArgs<T: GatewayTransport> {
    pub shard: ShardInfo,
    pub config: Arc<ClientConfig>,
    pub transport: T,
    pub identify: IdentifyGate,
    pub hub: EventHub,
}

pub struct ShardSession<T: GatewayTransport> {
    shard: ShardInfo,
    config: Arc<ClientConfig>,
    actor_ref: ActorRef<Self>,
    adapter: TransportAdapter<T>,
    identify: IdentifyGate,
    hub: EventHub,
    state: SessionState,
    connection: Option<u64>,
    handshake_sent: bool,
    session_id: Option<String>,
    resume_url: Option<String>,
    sequence: Option<u64>,
    heartbeat: HeartbeatTracker,
    reconnect: ExponentialBackoff,
    reconnect_attempt: u32,
    reconnect_epoch: u64,
    commands: WindowLimiter,
    health: SessionHealth,
    fatal: Option<FatalCause>,
    pump_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    identify_task: Option<JoinHandle<()>>,
}

impl<T: GatewayTransport> Actor for ShardSession<T> {
    type Args = ShardSessionArgs<T>;
    type Error = ClientError;

    fn name() -> &'static str {
        "ShardSession"
    }

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> ClientResult<Self> {
        let ShardSessionArgs {
            shard,
            config,
            transport,
            identify,
            hub,
        } = args;

        let (adapter, mut events) = TransportAdapter::new(transport, config.compression);
        let pump_ref = actor_ref.clone();
        let pump_task = tokio::spawn(async move {
            while let Some(envelope) = events.recv().await {
                if pump_ref.tell(Inbound(envelope)).send().await.is_err() {
                    break;
                }
            }
        });

        let reconnect = ExponentialBackoff::new(
            config.reconnect_backoff_base(),
            config.reconnect_backoff_max(),
            2.0,
        )
        .with_jitter(config.reconnect_backoff_jitter);

        Ok(Self {
            shard,
            actor_ref,
            adapter,
            identify,
            hub,
            state: SessionState::Disconnected,
            connection: None,
            handshake_sent: false,
            session_id: None,
            resume_url: None,
            sequence: None,
            heartbeat: HeartbeatTracker::new(config.heartbeat_ack_grace),
            reconnect,
            reconnect_attempt: 0,
            reconnect_epoch: 0,
            commands: WindowLimiter::new(
                "gateway_commands",
                config.gateway_commands_per_minute,
                COMMAND_WINDOW,
            ),
            health: SessionHealth::new()?,
            fatal: None,
            pump_task: Some(pump_task),
            heartbeat_task: None,
            identify_task: None,
            config,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> ClientResult<()> {
        self.stop_connection_tasks();
        self.adapter.close(1000, "shutdown");
        if let Some(task) = self.pump_task.take() {
            task.abort();
        }
        Ok(())
    }
}

/// Connect if the session is idle.
pub struct Start;

/// Discard all session state and connect from scratch.
pub struct Restart;

/// Close the socket and stay disconnected.
pub struct Shutdown;

pub struct GetSessionState;

pub struct GetSessionStats;

/// Why the session is `Fatal`, if it is.
pub struct GetFatalCause;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalCause {
    pub reason: String,
    pub authentication: bool,
}

/// Send an application command (presence update, member request, ...).
pub struct SendCommand {
    pub op: u8,
    pub data: Value,
}

/// Transport event forwarded from the adapter's channel.
pub struct Inbound(TransportEnvelope);

pub struct HeartbeatDue {
    connection: u64,
}

pub struct IdentifyGranted {
    connection: u64,
    outcome: ClientResult<()>,
}

pub struct ReconnectDue {
    epoch: u64,
}

impl<T: GatewayTransport> KameoMessage<Start> for ShardSession<T> {
    type Reply = ();

    async fn handle(&mut self, _msg: Start, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if matches!(self.state, SessionState::Disconnected) {
            self.connect();
        }
    }
}

impl<T: GatewayTransport> KameoMessage<Restart> for ShardSession<T> {
    type Reply = ();

    async fn handle(&mut self, _msg: Restart, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        info!(shard = %self.shard, state = %self.state, "restarting shard session");
        self.stop_connection_tasks();
        self.adapter.close(1000, "restart");
        self.connection = None;
        self.clear_session();
        self.reconnect.reset();
        self.reconnect_attempt = 0;
        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        self.transition(SessionState::Disconnected);
        self.connect();
    }
}

impl<T: GatewayTransport> KameoMessage<Shutdown> for ShardSession<T> {
    type Reply = ClientResult<()>;

    async fn handle(&mut self, _msg: Shutdown, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.stop_connection_tasks();
        self.adapter.close(1000, "shutdown");
        self.connection = None;
        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        self.transition(SessionState::Disconnected);
        Ok(())
    }
}

impl<T: GatewayTransport> KameoMessage<GetSessionState> for ShardSession<T> {
    type Reply = ClientResult<SessionState>;

    async fn handle(
        &mut self,
        _msg: GetSessionState,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.state)
    }
}

impl<T: GatewayTransport> KameoMessage<GetSessionStats> for ShardSession<T> {
    type Reply = ClientResult<SessionStats>;

    async fn handle(
        &mut self,
        _msg: GetSessionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.snapshot(self.state, self.sequence))
    }
}

impl<T: GatewayTransport> KameoMessage<GetFatalCause> for ShardSession<T> {
    type Reply = ClientResult<Option<FatalCause>>;

    async fn handle(
        &mut self,
        _msg: GetFatalCause,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.fatal.clone())
    }
}

impl<T: GatewayTransport> KameoMessage<SendCommand> for ShardSession<T> {
    type Reply = ClientResult<()>;

    async fn handle(&mut self, msg: SendCommand, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if !OpCode::is_application_command(msg.op) {
            return Err(ClientError::InvalidState(format!(
                "opcode {} is managed by the session",
                msg.op
            )));
        }
        if !self.state.is_ready() {
            return Err(ClientError::InvalidState(format!(
                "shard {} is {}",
                self.shard, self.state
            )));
        }
        self.commands.try_acquire()?;
        let payload = command_payload(msg.op, &msg.data)?;
        self.adapter.send(WsFrame::text(payload)).await
    }
}

impl<T: GatewayTransport> KameoMessage<Inbound> for ShardSession<T> {
    type Reply = ();

    async fn handle(&mut self, msg: Inbound, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let Inbound(envelope) = msg;
        if self.connection != Some(envelope.connection) {
            debug!(
                shard = %self.shard,
                connection = envelope.connection,
                "dropping event from stale connection"
            );
            return;
        }

        match envelope.event {
            TransportEvent::Opened => {
                info!(shard = %self.shard, connection = envelope.connection, "gateway connected");
                self.transition(SessionState::Identifying);
                self.hub.notify(self.shard.id, LifecycleKind::Connected);
            }
            TransportEvent::MessageReceived(text) => {
                self.health.record_message();
                match parse_message(&text) {
                    Ok(message) => self.on_gateway_message(message).await,
                    Err(err) => {
                        warn!(shard = %self.shard, error = %err, "ignoring malformed gateway payload")
                    }
                }
            }
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
            TransportEvent::TransportError(error) if self.adapter.is_live() => {
                warn!(shard = %self.shard, error = %error, "dropping undecodable gateway payload");
            }
            TransportEvent::TransportError(error) => {
                warn!(shard = %self.shard, state = %self.state, error = %error, "gateway transport error");
                self.schedule_reconnect("transport_error", &error);
            }
        }
    }
}

impl<T: GatewayTransport> KameoMessage<HeartbeatDue> for ShardSession<T> {
    type Reply = ();

    async fn handle(&mut self, msg: HeartbeatDue, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if self.connection != Some(msg.connection) {
            return;
        }
        match self.heartbeat.on_tick() {
            HeartbeatTick::Send => self.send_heartbeat().await,
            HeartbeatTick::Dead { missed } => {
                warn!(shard = %self.shard, missed, "heartbeat acknowledgements missing; connection is dead");
                self.begin_resume("heartbeat ack timeout");
            }
        }
    }
}

impl<T: GatewayTransport> KameoMessage<IdentifyGranted> for ShardSession<T> {
    type Reply = ();

    async fn handle(
        &mut self,
        msg: IdentifyGranted,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        self.identify_task = None;
        if self.connection != Some(msg.connection)
            || self.state != SessionState::Identifying
            || self.handshake_sent
        {
            debug!(shard = %self.shard, "identify token arrived for a superseded connection");
            return;
        }
        if let Err(err) = msg.outcome {
            error!(shard = %self.shard, error = %err, "identify admission failed");
            self.schedule_reconnect("identify_denied", &err.to_string());
            return;
        }

        let payload = match identify_payload(
            self.config.bare_token(),
            self.config.intents,
            self.shard,
            self.config.compression,
        ) {
            Ok(payload) => payload,
            Err(err) => {
                self.enter_fatal(&err.to_string(), false);
                return;
            }
        };
        self.handshake_sent = true;
        info!(shard = %self.shard, "sending identify");
        if let Err(err) = self.adapter.send(WsFrame::text(payload)).await {
            self.schedule_reconnect("identify_send_failed", &err.to_string());
        }
    }
}

impl<T: GatewayTransport> KameoMessage<ReconnectDue> for ShardSession<T> {
    type Reply = ();

    async fn handle(&mut self, msg: ReconnectDue, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        if msg.epoch == self.reconnect_epoch && self.state == SessionState::ReconnectPending {
            self.connect();
        }
    }
}

impl<T: GatewayTransport> ShardSession<T> {
    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(shard = %self.shard, from = %self.state, to = %next, "shard state transition");
            self.state = next;
        }
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        self.resume_url = None;
        self.sequence = None;
    }

    fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    fn stop_connection_tasks(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        if let Some(task) = self.identify_task.take() {
            task.abort();
        }
        self.heartbeat.reset();
    }

    fn connect(&mut self) {
        self.stop_connection_tasks();
        let base = match (&self.resume_url, self.can_resume()) {
            (Some(url), true) => url.as_str(),
            _ => self.config.gateway_url.as_str(),
        };
        let url = gateway_url(base, self.config.compression);
        self.handshake_sent = false;
        self.fatal = None;
        self.commands = WindowLimiter::new(
            "gateway_commands",
            self.config.gateway_commands_per_minute,
            COMMAND_WINDOW,
        );
        self.transition(SessionState::Connecting);
        self.adapter.close(RESUME_CLOSE_CODE, "reconnecting");
        self.connection = Some(self.adapter.open(&url));
    }

    async fn on_gateway_message(&mut self, message: GatewayMessage) {
        match message {
            GatewayMessage::Hello { heartbeat_interval } => {
                debug!(shard = %self.shard, interval_ms = heartbeat_interval.as_millis() as u64, "received hello");
                self.start_heartbeat(heartbeat_interval);
                if self.state == SessionState::Identifying && !self.handshake_sent {
                    if self.can_resume() {
                        self.send_resume().await;
                    } else {
                        self.request_identify();
                    }
                }
            }
            GatewayMessage::Heartbeat => self.send_heartbeat().await,
            GatewayMessage::HeartbeatAck => {
                if let Some(rtt) = self.heartbeat.record_ack(Instant::now()) {
                    self.health.record_rtt(rtt);
                }
                if self.state == SessionState::Ready {
                    self.transition(SessionState::Heartbeating);
                }
            }
            GatewayMessage::Reconnect => {
                info!(shard = %self.shard, "server requested reconnect");
                self.begin_resume("server requested reconnect");
            }
            GatewayMessage::InvalidSession { resumable } => {
                if resumable && self.can_resume() {
                    info!(shard = %self.shard, "session invalidated but resumable");
                    self.begin_resume("resumable invalid session");
                } else {
                    warn!(
                        shard = %self.shard,
                        sequence = self.sequence,
                        "session rejected; identifying as a new session"
                    );
                    self.clear_session();
                    self.handshake_sent = false;
                    self.transition(SessionState::Identifying);
                    self.request_identify();
                }
            }
            GatewayMessage::Dispatch {
                kind,
                sequence,
                data,
            } => self.on_dispatch(kind, sequence, data),
            GatewayMessage::Unknown { op } => {
                debug!(shard = %self.shard, op, "ignoring unknown opcode")
            }
        }
    }

    fn on_dispatch(&mut self, kind: String, sequence: u64, data: Value) {
        if !self.state.accepts_dispatch() {
            debug!(shard = %self.shard, state = %self.state, kind = %kind, "dropping dispatch outside a live session");
            return;
        }
        if self.sequence.is_some_and(|last| sequence <= last) {
            debug!(shard = %self.shard, sequence, kind = %kind, "skipping replayed dispatch");
            return;
        }
        self.sequence = Some(sequence);

        match kind.as_str() {
            "READY" => match ReadyInfo::from_value(&data) {
                Ok(ready) => {
                    info!(shard = %self.shard, session = %ready.session_id, "session ready");
                    self.hub.notify(
                        self.shard.id,
                        LifecycleKind::Ready {
                            session_id: ready.session_id.clone(),
                        },
                    );
                    self.session_id = Some(ready.session_id);
                    self.resume_url = ready.resume_gateway_url;
                    self.mark_ready();
                }
                Err(err) => warn!(shard = %self.shard, error = %err, "unusable READY payload"),
            },
            "RESUMED" => {
                info!(shard = %self.shard, sequence, "session resumed");
                self.hub.notify(self.shard.id, LifecycleKind::Resumed);
                self.mark_ready();
            }
            _ => {}
        }

        self.hub.publish(GatewayEvent {
            shard_id: self.shard.id,
            kind,
            sequence,
            payload: data,
        });
    }

    fn mark_ready(&mut self) {
        self.reconnect.reset();
        self.reconnect_attempt = 0;
        self.transition(SessionState::Ready);
    }

    fn start_heartbeat(&mut self, interval: Duration) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.heartbeat.reset();
        self.heartbeat.set_interval(interval);

        let Some(connection) = self.connection else {
            return;
        };
        let actor_ref = self.actor_ref.clone();
        // First beat lands at a random point inside the first interval.
        let first = Instant::now() + jitter_delay(interval, 1.0);
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref.tell(HeartbeatDue { connection }).send().await.is_err() {
                    break;
                }
            }
        }));
    }

    async fn send_heartbeat(&mut self) {
        let payload = match heartbeat_payload(self.sequence) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(shard = %self.shard, error = %err, "failed to encode heartbeat");
                return;
            }
        };
        self.heartbeat.record_sent(Instant::now());
        debug!(shard = %self.shard, sequence = self.sequence, "sending heartbeat");
        if let Err(err) = self.adapter.send(WsFrame::text(payload)).await {
            self.schedule_reconnect("heartbeat_send_failed", &err.to_string());
        }
    }

    async fn send_resume(&mut self) {
        let (Some(session_id), Some(sequence)) = (self.session_id.as_deref(), self.sequence) else {
            return;
        };
        let payload = match resume_payload(self.config.bare_token(), session_id, sequence) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(shard = %self.shard, error = %err, "failed to encode resume");
                return;
            }
        };
        self.handshake_sent = true;
        info!(shard = %self.shard, sequence, "sending resume");
        if let Err(err) = self.adapter.send(WsFrame::text(payload)).await {
            self.schedule_reconnect("resume_send_failed", &err.to_string());
        }
    }

    /// Wait for an identify token off the actor; the grant comes back as `IdentifyGranted`.
    fn request_identify(&mut self) {
        let Some(connection) = self.connection else {
            return;
        };
        if let Some(task) = self.identify_task.take() {
            task.abort();
        }
        let gate = self.identify.clone();
        let actor_ref = self.actor_ref.clone();
        debug!(shard = %self.shard, bucket = gate.key().bucket, "waiting for identify token");
        self.identify_task = Some(tokio::spawn(async move {
            let outcome = gate.acquire().await;
            let _ = actor_ref
                .tell(IdentifyGranted {
                    connection,
                    outcome,
                })
                .send()
                .await;
        }));
    }

    /// Drop the current connection and reconnect at once, keeping the session for a resume.
    /// Without a session to resume this is an ordinary backed-off reconnect.
    fn begin_resume(&mut self, reason: &str) {
        if !self.can_resume() {
            self.schedule_reconnect("not_resumable", reason);
            return;
        }
        self.transition(SessionState::Resuming);
        self.health.increment_reconnect();
        self.log_reconnect_plan("resume", reason, Some(Duration::ZERO));
        self.stop_connection_tasks();
        self.adapter.close(RESUME_CLOSE_CODE, reason);
        self.connection = None;
        self.connect();
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) {
        self.health.record_close(code);
        self.stop_connection_tasks();
        self.connection = None;
        self.hub.notify(
            self.shard.id,
            LifecycleKind::Disconnected {
                code,
                reason: reason.clone(),
            },
        );

        match classify_close(code) {
            CloseAction::AuthenticationFailed => {
                let reason = format!("authentication failed (code {code:?}): {reason}");
                self.enter_fatal(&reason, true);
            }
            CloseAction::Fatal => {
                let reason = format!("non-recoverable close code {code:?}: {reason}");
                self.enter_fatal(&reason, false);
            }
            CloseAction::Reidentify => {
                info!(shard = %self.shard, code, "session expired; next connect identifies");
                self.clear_session();
                self.schedule_reconnect("session_expired", &reason);
            }
            CloseAction::Resume => self.schedule_reconnect("closed", &reason),
        }
    }

    fn schedule_reconnect(&mut self, event: &str, reason: &str) {
        self.stop_connection_tasks();
        self.adapter.close(RESUME_CLOSE_CODE, "reconnecting");
        self.connection = None;

        let attempt = self.reconnect_attempt.saturating_add(1);
        self.reconnect_attempt = attempt;
        if let Some(max) = self.config.max_reconnect_attempts {
            if attempt > max {
                let reason = format!("gave up after {max} reconnect attempts: {reason}");
                self.enter_fatal(&reason, false);
                return;
            }
        }

        let delay = self.reconnect.next_delay();
        self.health.increment_reconnect();
        self.transition(SessionState::ReconnectPending);
        self.log_reconnect_plan(event, reason, Some(delay));
        self.hub.notify(
            self.shard.id,
            LifecycleKind::ReconnectScheduled { attempt, delay },
        );

        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        let epoch = self.reconnect_epoch;
        let actor_ref = self.actor_ref.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = actor_ref.tell(ReconnectDue { epoch }).send().await;
        });
    }

    fn enter_fatal(&mut self, reason: &str, authentication: bool) {
        self.stop_connection_tasks();
        self.adapter.close(1000, "fatal");
        self.connection = None;
        self.reconnect_epoch = self.reconnect_epoch.wrapping_add(1);
        self.transition(SessionState::Fatal);
        self.fatal = Some(FatalCause {
            reason: reason.to_string(),
            authentication,
        });
        error!(shard = %self.shard, authentication, reason = %reason, "shard session failed permanently");
        self.hub.notify(
            self.shard.id,
            LifecycleKind::Fatal {
                reason: reason.to_string(),
                authentication,
            },
        );
    }

    fn log_reconnect_plan(&self, event: &str, reason: &str, delay: Option<Duration>) {
        let stats = self.health.snapshot(self.state, self.sequence);
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let uptime_ms = stats.uptime.as_millis().min(u64::MAX as u128) as u64;
        let last_message_age_ms = stats.last_message_age.as_millis().min(u64::MAX as u128) as u64;
        warn!(
            shard = %self.shard,
            event = %event,
            reason = %reason,
            state = %self.state,
            attempt = self.reconnect_attempt,
            resumable = self.can_resume(),
            sequence = self.sequence,
            delay_ms,
            uptime_ms,
            last_message_age_ms,
            messages = stats.messages,
            reconnects = stats.reconnects,
            p99_rtt_us = stats.p99_heartbeat_rtt_us,
            "gateway reconnect plan"
        );
    }
}
