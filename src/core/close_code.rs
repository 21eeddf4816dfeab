//! Gateway close codes and how a session reacts to them.

use std::fmt;

/// Close codes the gateway uses when terminating a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

/// What the session does after a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume with the cached session.
    Resume,
    /// Reconnect, discard the session and identify again.
    Reidentify,
    /// Stop; surfaced as an authentication failure.
    AuthenticationFailed,
    /// Stop; the configuration cannot work against this server.
    Fatal,
}

impl CloseCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    pub const fn action(self) -> CloseAction {
        match self {
            Self::AuthenticationFailed => CloseAction::AuthenticationFailed,
            Self::InvalidShard
            | Self::ShardingRequired
            | Self::InvalidApiVersion
            | Self::InvalidIntents
            | Self::DisallowedIntents => CloseAction::Fatal,
            Self::InvalidSequence | Self::SessionTimedOut => CloseAction::Reidentify,
            Self::UnknownError
            | Self::UnknownOpcode
            | Self::DecodeError
            | Self::NotAuthenticated
            | Self::AlreadyAuthenticated
            | Self::RateLimited => CloseAction::Resume,
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown opcode sent",
            Self::DecodeError => "invalid payload sent",
            Self::NotAuthenticated => "payload sent before identify",
            Self::AuthenticationFailed => "authentication failed",
            Self::AlreadyAuthenticated => "identify sent twice",
            Self::InvalidSequence => "invalid resume sequence",
            Self::RateLimited => "gateway rate limit exceeded",
            Self::SessionTimedOut => "session timed out",
            Self::InvalidShard => "invalid shard",
            Self::ShardingRequired => "sharding required",
            Self::InvalidApiVersion => "invalid api version",
            Self::InvalidIntents => "invalid intents",
            Self::DisallowedIntents => "disallowed intents",
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

/// Classify a raw close code. Unknown codes and abnormal termination (no code) are resumable.
pub fn classify_close(code: Option<u16>) -> CloseAction {
    code.and_then(CloseCode::from_u16)
        .map(CloseCode::action)
        .unwrap_or(CloseAction::Resume)
}
