//! Gateway wire protocol: opcodes, inbound envelope parsing and outbound payload builders.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonic_rs::{JsonValueTrait, Value};

use crate::core::{ClientError, ClientResult, Compression, ShardInfo};

pub const GATEWAY_VERSION: u8 = 10;
const LARGE_THRESHOLD: u32 = 250;
const LIBRARY_NAME: &str = "shardwire";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl OpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    /// Whether applications may send this opcode as a command. Session-managed opcodes are
    /// excluded; unknown opcodes are passed through.
    pub fn is_application_command(op: u8) -> bool {
        match Self::from_u8(op) {
            Some(Self::PresenceUpdate | Self::VoiceStateUpdate | Self::RequestGuildMembers) => {
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundEnvelope {
    op: u8,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// A decoded gateway message.
#[derive(Debug, Clone)]
pub enum GatewayMessage {
    Dispatch {
        kind: String,
        sequence: u64,
        data: Value,
    },
    /// The server asks for an immediate heartbeat.
    Heartbeat,
    Reconnect,
    InvalidSession {
        resumable: bool,
    },
    Hello {
        heartbeat_interval: Duration,
    },
    HeartbeatAck,
    Unknown {
        op: u8,
    },
}

pub fn parse_message(text: &str) -> ClientResult<GatewayMessage> {
    let envelope: InboundEnvelope = sonic_rs::from_str(text)
        .map_err(|err| ClientError::Protocol(format!("invalid gateway envelope: {err}")))?;

    let message = match OpCode::from_u8(envelope.op) {
        Some(OpCode::Dispatch) => {
            let kind = envelope
                .t
                .ok_or_else(|| ClientError::Protocol("dispatch without event name".into()))?;
            let sequence = envelope
                .s
                .ok_or_else(|| ClientError::Protocol(format!("dispatch {kind} without sequence")))?;
            GatewayMessage::Dispatch {
                kind,
                sequence,
                data: envelope.d.unwrap_or_default(),
            }
        }
        Some(OpCode::Heartbeat) => GatewayMessage::Heartbeat,
        Some(OpCode::Reconnect) => GatewayMessage::Reconnect,
        Some(OpCode::InvalidSession) => GatewayMessage::InvalidSession {
            resumable: envelope
                .d
                .as_ref()
                .and_then(|d| d.as_bool())
                .unwrap_or(false),
        },
        Some(OpCode::Hello) => {
            let millis = envelope
                .d
                .as_ref()
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|v| v.as_u64())
                .filter(|ms| *ms > 0)
                .ok_or_else(|| ClientError::Protocol("hello without heartbeat_interval".into()))?;
            GatewayMessage::Hello {
                heartbeat_interval: Duration::from_millis(millis),
            }
        }
        Some(OpCode::HeartbeatAck) => GatewayMessage::HeartbeatAck,
        _ => GatewayMessage::Unknown { op: envelope.op },
    };
    Ok(message)
}

/// Fields of the `READY` dispatch the session keeps for resuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyInfo {
    pub session_id: String,
    pub resume_gateway_url: Option<String>,
}

impl ReadyInfo {
    pub fn from_value(data: &Value) -> ClientResult<Self> {
        let session_id = data
            .get("session_id")
            .and_then(|v| v.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ClientError::Protocol("READY without session_id".into()))?;
        let resume_gateway_url = data
            .get("resume_gateway_url")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(Self {
            session_id: session_id.to_string(),
            resume_gateway_url,
        })
    }
}

#[derive(Serialize)]
struct Outbound<D: Serialize> {
    op: u8,
    d: D,
}

#[derive(Serialize)]
struct ConnectionProperties {
    os: &'static str,
    browser: &'static str,
    device: &'static str,
}

#[derive(Serialize)]
struct IdentifyData<'a> {
    token: &'a str,
    intents: u64,
    properties: ConnectionProperties,
    shard: ShardInfo,
    compress: bool,
    large_threshold: u32,
}

#[derive(Serialize)]
struct ResumeData<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

fn encode<D: Serialize>(op: OpCode, d: D) -> ClientResult<String> {
    encode_raw(op as u8, d)
}

fn encode_raw<D: Serialize>(op: u8, d: D) -> ClientResult<String> {
    sonic_rs::to_string(&Outbound { op, d })
        .map_err(|err| ClientError::Protocol(format!("encode op {op}: {err}")))
}

pub fn identify_payload(
    token: &str,
    intents: u64,
    shard: ShardInfo,
    compression: Compression,
) -> ClientResult<String> {
    encode(
        OpCode::Identify,
        IdentifyData {
            token,
            intents,
            properties: ConnectionProperties {
                os: std::env::consts::OS,
                browser: LIBRARY_NAME,
                device: LIBRARY_NAME,
            },
            shard,
            compress: compression == Compression::Payload,
            large_threshold: LARGE_THRESHOLD,
        },
    )
}

pub fn resume_payload(token: &str, session_id: &str, seq: u64) -> ClientResult<String> {
    encode(
        OpCode::Resume,
        ResumeData {
            token,
            session_id,
            seq,
        },
    )
}

pub fn heartbeat_payload(sequence: Option<u64>) -> ClientResult<String> {
    encode(OpCode::Heartbeat, sequence)
}

pub fn command_payload(op: u8, data: &Value) -> ClientResult<String> {
    encode_raw(op, data)
}

/// Connection URL for a gateway base URL.
pub fn gateway_url(base: &str, compression: Compression) -> String {
    let base = base.trim_end_matches('/');
    let mut url = if base.contains('?') {
        format!("{base}&v={GATEWAY_VERSION}&encoding=json")
    } else {
        format!("{base}/?v={GATEWAY_VERSION}&encoding=json")
    };
    if compression == Compression::Stream {
        url.push_str("&compress=zlib-stream");
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dispatch_and_control_messages() {
        match parse_message(r#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"id":"1"}}"#).unwrap() {
            GatewayMessage::Dispatch {
                kind,
                sequence,
                data,
            } => {
                assert_eq!(kind, "MESSAGE_CREATE");
                assert_eq!(sequence, 42);
                assert_eq!(data.get("id").and_then(|v| v.as_str()), Some("1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        assert!(matches!(
            parse_message(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap(),
            GatewayMessage::Hello { heartbeat_interval } if heartbeat_interval == Duration::from_millis(41250)
        ));
        assert!(matches!(
            parse_message(r#"{"op":9,"d":true}"#).unwrap(),
            GatewayMessage::InvalidSession { resumable: true }
        ));
        assert!(matches!(
            parse_message(r#"{"op":9,"d":false,"s":null,"t":null}"#).unwrap(),
            GatewayMessage::InvalidSession { resumable: false }
        ));
        assert!(matches!(
            parse_message(r#"{"op":11}"#).unwrap(),
            GatewayMessage::HeartbeatAck
        ));
        assert!(matches!(
            parse_message(r#"{"op":42,"d":null}"#).unwrap(),
            GatewayMessage::Unknown { op: 42 }
        ));
    }

    #[test]
    fn malformed_payloads_are_protocol_errors() {
        for text in [
            "not json",
            r#"{"op":0,"t":"READY"}"#,
            r#"{"op":10,"d":{}}"#,
        ] {
            assert!(
                matches!(parse_message(text), Err(ClientError::Protocol(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn ready_info_requires_session_id() {
        let data: Value =
            sonic_rs::from_str(r#"{"session_id":"abc","resume_gateway_url":"wss://resume"}"#)
                .unwrap();
        let ready = ReadyInfo::from_value(&data).unwrap();
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.resume_gateway_url.as_deref(), Some("wss://resume"));

        let empty: Value = sonic_rs::from_str("{}").unwrap();
        assert!(ReadyInfo::from_value(&empty).is_err());
    }

    #[test]
    fn builds_outbound_payloads() {
        let identify =
            identify_payload("tok", 513, ShardInfo::new(1, 4), Compression::None).unwrap();
        let value: Value = sonic_rs::from_str(&identify).unwrap();
        assert_eq!(value.get("op").and_then(|v| v.as_u64()), Some(2));
        let d = value.get("d").unwrap();
        assert_eq!(d.get("token").and_then(|v| v.as_str()), Some("tok"));
        assert_eq!(d.get("intents").and_then(|v| v.as_u64()), Some(513));
        assert_eq!(
            d.get("shard").map(|v| v.to_string()).as_deref(),
            Some("[1,4]")
        );

        assert_eq!(heartbeat_payload(None).unwrap(), r#"{"op":1,"d":null}"#);
        assert_eq!(heartbeat_payload(Some(7)).unwrap(), r#"{"op":1,"d":7}"#);
        assert_eq!(
            resume_payload("tok", "sess", 9).unwrap(),
            r#"{"op":6,"d":{"token":"tok","session_id":"sess","seq":9}}"#
        );
    }

    #[test]
    fn command_opcodes_exclude_session_managed_ones() {
        assert!(OpCode::is_application_command(3));
        assert!(OpCode::is_application_command(8));
        assert!(!OpCode::is_application_command(2));
        assert!(!OpCode::is_application_command(6));
        assert!(!OpCode::is_application_command(1));
    }

    #[test]
    fn gateway_urls_carry_version_and_compression() {
        assert_eq!(
            gateway_url("wss://gateway.example/", Compression::None),
            "wss://gateway.example/?v=10&encoding=json"
        );
        assert_eq!(
            gateway_url("wss://gateway.example", Compression::Stream),
            "wss://gateway.example/?v=10&encoding=json&compress=zlib-stream"
        );
    }
}
