//! All Synapse session protocol message types.
//!
//! The session protocol only covers connection lifecycle: identity exchange,
//! keep-alive, graceful goodbye and error reporting.  Application payloads
//! ride on top of an established session and are not defined here.

use serde::{Deserialize, Serialize};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common message header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Largest payload accepted on the wire (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes defined by the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Welcome = 0x02,
    Ping = 0x07,
    Pong = 0x08,
    Bye = 0x09,
    Error = 0x0A,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x07 => Ok(MessageType::Ping),
            0x08 => Ok(MessageType::Pong),
            0x09 => Ok(MessageType::Bye),
            0x0A => Ok(MessageType::Error),
            _ => Err(()),
        }
    }
}

// ── Common message header ─────────────────────────────────────────────────────

/// 24-byte header prepended to every message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Protocol version; always [`PROTOCOL_VERSION`] for frames we emit.
    pub version: u8,
    /// Identifies the payload type.
    pub message_type: MessageType,
    /// Length of the payload in bytes (not including this header).
    pub payload_length: u32,
    /// Monotonically increasing per-connection counter.
    pub sequence_number: u64,
    /// Microseconds since Unix epoch at time of generation.
    pub timestamp_us: u64,
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// HELLO (0x01): first frame sent by the connecting side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version the sender speaks.
    pub protocol_version: u8,
    /// Opaque identifier, unique per device.
    pub device_id: String,
    /// Human-readable hostname or display name.
    pub device_name: String,
}

/// WELCOME (0x02): the accepting side's reply to a valid HELLO.
///
/// Carries the server's own identity so the client can show who it is
/// talking to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub protocol_version: u8,
    pub device_id: String,
    pub device_name: String,
}

/// Reason for a graceful disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReason {
    UserInitiated = 0x01,
    ServerShutdown = 0x02,
    ProtocolError = 0x03,
    Timeout = 0x04,
    /// A newer connection registered the same device id.
    Replaced = 0x05,
}

impl TryFrom<u8> for DisconnectReason {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DisconnectReason::UserInitiated),
            0x02 => Ok(DisconnectReason::ServerShutdown),
            0x03 => Ok(DisconnectReason::ProtocolError),
            0x04 => Ok(DisconnectReason::Timeout),
            0x05 => Ok(DisconnectReason::Replaced),
            _ => Err(()),
        }
    }
}

/// Protocol-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProtocolErrorCode {
    ProtocolVersionMismatch = 0x01,
    InvalidHandshake = 0x02,
    InternalError = 0x07,
    InvalidMessage = 0x08,
}

/// ERROR (0x0A): sent before closing a connection that is being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Protocol error code.
    pub error_code: ProtocolErrorCode,
    /// Human-readable description (for logging on the receiving side).
    pub description: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// All valid session messages, discriminated by type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    Hello(HelloMessage),
    Welcome(WelcomeMessage),
    Ping(u64),
    Pong(u64),
    Bye { reason: DisconnectReason },
    Error(ErrorMessage),
}

impl SessionMessage {
    /// Returns the [`MessageType`] discriminant for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            SessionMessage::Hello(_) => MessageType::Hello,
            SessionMessage::Welcome(_) => MessageType::Welcome,
            SessionMessage::Ping(_) => MessageType::Ping,
            SessionMessage::Pong(_) => MessageType::Pong,
            SessionMessage::Bye { .. } => MessageType::Bye,
            SessionMessage::Error(_) => MessageType::Error,
        }
    }
}
