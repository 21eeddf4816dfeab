use std::fmt;
use std::time::Duration;

use kameo::error::SendError;
use serde::Serialize;
use thiserror::Error;

/// Convenience result alias used across the crate.
pub type ClientResult<T> = Result<T, ClientError>;

/// Canonical error surface shared by the gateway and REST halves of the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not be established (DNS, TLS, refused).
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Malformed or unexpected payload from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed (close code {code:?}): {reason}")]
    Authentication { code: Option<u16>, reason: String },

    /// The server no longer accepts the cached session; a fresh identify follows.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Rate limited on {scope} (global={global}, retry after {retry_after:?})")]
    RateLimited {
        scope: String,
        global: bool,
        retry_after: Duration,
    },

    /// 4xx other than 429. Never retried.
    #[error("Request rejected with status {status}: {body}")]
    RequestRejected { status: u16, body: String },

    /// 5xx or transport failure after the retry budget was spent.
    #[error("Server error (status={status:?}): {message}")]
    TransientServer { status: Option<u16>, message: String },

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Actor error: {0}")]
    ActorError(String),
}

impl ClientError {
    /// Whether the condition is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_)
                | ClientError::RateLimited { .. }
                | ClientError::TransientServer { .. }
                | ClientError::Transport { .. }
                | ClientError::SessionExpired(_)
        )
    }

    /// Whether the failure requires operator action rather than a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Authentication { .. } | ClientError::Config(_)
        )
    }
}

/// Collapse an actor `ask` result: handler errors pass through, mailbox failures become
/// `ClientError::ActorError`.
pub(crate) fn flatten_ask<T, M>(result: Result<T, SendError<M, ClientError>>) -> ClientResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(SendError::HandlerError(err)) => Err(err),
        Err(err) => Err(ClientError::ActorError(err.to_string())),
    }
}

/// Shard identity: index and total shard count of the owning client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShardInfo {
    pub id: u32,
    pub total: u32,
}

impl ShardInfo {
    pub fn new(id: u32, total: u32) -> Self {
        Self { id, total }
    }

    /// Shard responsible for a snowflake-style resource id.
    pub fn for_resource(resource_id: u64, total: u32) -> u32 {
        ((resource_id >> 22) % u64::from(total.max(1))) as u32
    }
}

impl Serialize for ShardInfo {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.id, self.total].serialize(serializer)
    }
}

impl fmt::Display for ShardInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.id, self.total)
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Transport open; waiting for hello, then identify or resume acknowledgement.
    Identifying,
    Ready,
    /// Ready and at least one heartbeat acknowledged.
    Heartbeating,
    Resuming,
    ReconnectPending,
    Fatal,
}

impl SessionState {
    /// States in which dispatches from the server are accepted.
    pub fn accepts_dispatch(self) -> bool {
        matches!(
            self,
            SessionState::Identifying | SessionState::Ready | SessionState::Heartbeating
        )
    }

    pub fn is_ready(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Heartbeating)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Identifying => "identifying",
            SessionState::Ready => "ready",
            SessionState::Heartbeating => "heartbeating",
            SessionState::Resuming => "resuming",
            SessionState::ReconnectPending => "reconnect_pending",
            SessionState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Basic session statistics snapshot.
#[derive(Clone, Debug)]
pub struct SessionStats {
    pub state: SessionState,
    pub sequence: Option<u64>,
    pub uptime: Duration,
    pub messages: u64,
    pub reconnects: u64,
    pub last_message_age: Duration,
    pub recent_close_codes: Vec<Option<u16>>,
    pub p50_heartbeat_rtt_us: u64,
    pub p99_heartbeat_rtt_us: u64,
    pub heartbeat_samples: u64,
}

/// Abstract reconnect strategy.
pub trait ReconnectStrategy: Send + Sync + 'static {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_info_serializes_as_pair() {
        let shard = ShardInfo::new(2, 5);
        assert_eq!(sonic_rs::to_string(&shard).unwrap(), "[2,5]");
        assert_eq!(shard.to_string(), "[2/5]");
    }

    #[test]
    fn resource_ids_map_to_stable_shards() {
        let guild = 41771983423143937_u64;
        let shard = ShardInfo::for_resource(guild, 4);
        assert!(shard < 4);
        assert_eq!(shard, ShardInfo::for_resource(guild, 4));
        assert_eq!(ShardInfo::for_resource(guild, 1), 0);
    }

    #[test]
    fn error_classification() {
        assert!(ClientError::Connection("refused".into()).is_retryable());
        assert!(
            ClientError::Authentication {
                code: Some(4004),
                reason: "bad token".into()
            }
            .is_fatal()
        );
        assert!(
            !ClientError::RequestRejected {
                status: 404,
                body: String::new()
            }
            .is_retryable()
        );
    }
}
