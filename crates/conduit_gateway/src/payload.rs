//! Gateway payload model.
//!
//! Inbound frames are decoded in two steps: the envelope is read first, then
//! `d` is decoded into the shape its opcode names. Outbound frames are built
//! from [`ClientPayload`].

use conduit_error::{GatewayError, GatewayErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway opcodes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr, strum::EnumIter,
)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched
    Dispatch = 0,
    /// Heartbeat, sent by either side
    Heartbeat = 1,
    /// Start a new session
    Identify = 2,
    /// Update the client's presence
    PresenceUpdate = 3,
    /// Join, move or leave voice channels
    VoiceStateUpdate = 4,
    /// Resume a previous session
    Resume = 6,
    /// Server asks the client to reconnect and resume
    Reconnect = 7,
    /// Request offline guild members
    RequestGuildMembers = 8,
    /// The session has been invalidated
    InvalidSession = 9,
    /// First frame after connecting
    Hello = 10,
    /// Heartbeat acknowledged
    HeartbeatAck = 11,
}

impl OpCode {
    /// Wire value.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Whether the session consumes this opcode instead of forwarding it.
    ///
    /// Opcodes that only clients send are forwarded if a server ever sends
    /// them, like any opcode this enum does not name.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            OpCode::Heartbeat
                | OpCode::Reconnect
                | OpCode::InvalidSession
                | OpCode::Hello
                | OpCode::HeartbeatAck
        )
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

/// Hello payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Hello {
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval: u64,
}

/// A forwarded frame, still undecoded.
///
/// Usually op 0. Frames with any other non-control opcode are forwarded too;
/// without a `t` they are named `OP_<n>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Wire opcode
    pub op: u8,
    /// Sequence number
    pub sequence: Option<u64>,
    /// Event name, e.g. `MESSAGE_CREATE`
    pub event: String,
    /// Raw event data
    pub data: Value,
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerPayload {
    /// op 0, or any opcode the session does not consume
    Dispatch(Dispatch),
    /// op 1: the server wants a heartbeat now
    Heartbeat,
    /// op 7
    Reconnect,
    /// op 9
    InvalidSession {
        /// Whether the session may be resumed
        resumable: bool,
    },
    /// op 10
    Hello(Hello),
    /// op 11
    HeartbeatAck,
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone)]
pub enum PayloadError {
    /// A Hello frame (or an unreadable envelope) was malformed.
    /// Session state can no longer be trusted.
    Control(GatewayError),
    /// One dispatched event was malformed; the session carries on.
    Event {
        /// Sequence number from the envelope, if it was readable
        sequence: Option<u64>,
        /// What went wrong
        error: GatewayError,
    },
}

impl PayloadError {
    /// The underlying error.
    pub fn error(&self) -> &GatewayError {
        match self {
            PayloadError::Control(error) | PayloadError::Event { error, .. } => error,
        }
    }
}

fn decode_error(message: impl Into<String>) -> GatewayError {
    GatewayError::new(GatewayErrorKind::Decode(message.into()))
}

impl ServerPayload {
    /// Decode one inflated frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| PayloadError::Control(decode_error(format!("envelope: {}", e))))?;

        match OpCode::from_repr(envelope.op) {
            Some(OpCode::Heartbeat) => Ok(ServerPayload::Heartbeat),
            Some(OpCode::Reconnect) => Ok(ServerPayload::Reconnect),
            Some(OpCode::InvalidSession) => Ok(ServerPayload::InvalidSession {
                resumable: envelope.d.as_bool().unwrap_or(false),
            }),
            Some(OpCode::Hello) => serde_json::from_value(envelope.d)
                .map(ServerPayload::Hello)
                .map_err(|e| PayloadError::Control(decode_error(format!("hello: {}", e)))),
            Some(OpCode::HeartbeatAck) => Ok(ServerPayload::HeartbeatAck),
            _ => Self::forwarded(envelope),
        }
    }

    fn forwarded(envelope: Envelope) -> Result<Self, PayloadError> {
        let Envelope { op, d, s, t } = envelope;
        let event = match t {
            Some(name) => name,
            None if op == OpCode::Dispatch.code() => {
                return Err(PayloadError::Event {
                    sequence: s,
                    error: decode_error("dispatch without event name"),
                });
            }
            None => format!("OP_{}", op),
        };
        Ok(ServerPayload::Dispatch(Dispatch {
            op,
            sequence: s,
            event,
            data: d,
        }))
    }

    /// Wire opcode this payload arrived with.
    pub fn opcode(&self) -> u8 {
        match self {
            ServerPayload::Dispatch(dispatch) => dispatch.op,
            ServerPayload::Heartbeat => OpCode::Heartbeat.code(),
            ServerPayload::Reconnect => OpCode::Reconnect.code(),
            ServerPayload::InvalidSession { .. } => OpCode::InvalidSession.code(),
            ServerPayload::Hello(_) => OpCode::Hello.code(),
            ServerPayload::HeartbeatAck => OpCode::HeartbeatAck.code(),
        }
    }
}

/// Fields of the READY event the session keeps.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ready {
    /// Session to resume later
    pub session_id: String,
    /// Host to resume against
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    /// `[shard_id, shard_count]`
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
}

/// Client identification sent with Identify.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionProperties {
    /// Operating system
    pub os: String,
    /// Library name
    pub browser: String,
    /// Library name
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "conduit".to_string(),
            device: "conduit".to_string(),
        }
    }
}

/// op 2 payload.
#[derive(Clone, Serialize)]
pub struct Identify {
    /// Bot token
    pub token: String,
    /// Gateway intents
    pub intents: u64,
    /// Client identification
    pub properties: ConnectionProperties,
    /// `[shard_id, shard_count]`
    pub shard: [u32; 2],
    /// Offline member threshold
    pub large_threshold: u32,
    /// Per-message compression, never used
    pub compress: bool,
    /// Initial presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

impl std::fmt::Debug for Identify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identify")
            .field("token", &"[redacted]")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .field("large_threshold", &self.large_threshold)
            .finish_non_exhaustive()
    }
}

/// op 6 payload.
#[derive(Clone, Serialize)]
pub struct Resume {
    /// Bot token
    pub token: String,
    /// Session being resumed
    pub session_id: String,
    /// Last sequence number received
    pub seq: u64,
}

impl std::fmt::Debug for Resume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resume")
            .field("token", &"[redacted]")
            .field("session_id", &self.session_id)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Caller-initiated commands. These share the per-connection command budget.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// op 3
    PresenceUpdate(Value),
    /// op 4
    VoiceStateUpdate(Value),
    /// op 8
    RequestGuildMembers(Value),
}

impl Command {
    /// Opcode this command is sent with.
    pub fn opcode(&self) -> OpCode {
        match self {
            Command::PresenceUpdate(_) => OpCode::PresenceUpdate,
            Command::VoiceStateUpdate(_) => OpCode::VoiceStateUpdate,
            Command::RequestGuildMembers(_) => OpCode::RequestGuildMembers,
        }
    }
}

/// Outbound frame.
#[derive(Debug, Clone)]
pub enum ClientPayload {
    /// op 1 with the last sequence number
    Heartbeat(Option<u64>),
    /// op 2
    Identify(Identify),
    /// op 6
    Resume(Resume),
    /// op 3, 4 or 8
    Command(Command),
}

#[derive(Serialize)]
struct Outbound<'a, T: Serialize> {
    op: u8,
    d: &'a T,
}

fn encode<T: Serialize>(op: OpCode, d: &T) -> Result<String, GatewayError> {
    serde_json::to_string(&Outbound { op: op.code(), d })
        .map_err(|e| GatewayError::new(GatewayErrorKind::Decode(format!("encode {}: {}", op, e))))
}

impl ClientPayload {
    /// Opcode this payload is sent with.
    pub fn opcode(&self) -> OpCode {
        match self {
            ClientPayload::Heartbeat(_) => OpCode::Heartbeat,
            ClientPayload::Identify(_) => OpCode::Identify,
            ClientPayload::Resume(_) => OpCode::Resume,
            ClientPayload::Command(command) => command.opcode(),
        }
    }

    /// Serialise to the JSON text frame.
    pub fn to_json(&self) -> Result<String, GatewayError> {
        let op = self.opcode();
        match self {
            ClientPayload::Heartbeat(seq) => encode(op, seq),
            ClientPayload::Identify(identify) => encode(op, identify),
            ClientPayload::Resume(resume) => encode(op, resume),
            ClientPayload::Command(
                Command::PresenceUpdate(d)
                | Command::VoiceStateUpdate(d)
                | Command::RequestGuildMembers(d),
            ) => encode(op, d),
        }
    }
}
