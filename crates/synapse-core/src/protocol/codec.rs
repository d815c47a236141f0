//! Binary codec for encoding and decoding Synapse session messages.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][reserved:2][payload_len:4][seq:8][timestamp_us:8][payload:N]
//! ```
//! Total header size: 24 bytes. All multi-byte integers are big-endian.
//! Strings are a 2-byte length prefix followed by UTF-8 bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol::messages::{
    DisconnectReason, ErrorMessage, HelloMessage, MessageType, ProtocolErrorCode, SessionMessage,
    WelcomeMessage, HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
use thiserror::Error;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice does not yet hold a complete frame.
    ///
    /// Stream readers treat this as "read more bytes", not as a failure.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The message type byte in the header is not a recognized value.
    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    /// The protocol version in the header is not supported.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The declared payload exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {declared} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge { declared: usize },

    /// The payload could not be parsed (field value out of range, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`SessionMessage`] into a byte vector including the 24-byte header.
///
/// The sequence number is **not** set by this function – pass a pre-incremented
/// value from a [`crate::protocol::SequenceCounter`].
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the encoded payload would not
/// be accepted by a peer, or [`ProtocolError::MalformedPayload`] if a string
/// field does not fit its 16-bit length prefix.
///
/// # Examples
///
/// ```rust
/// use synapse_core::protocol::{encode_message, decode_message};
/// use synapse_core::protocol::messages::SessionMessage;
///
/// let msg = SessionMessage::Ping(42);
/// let bytes = encode_message(&msg, 0, 0).unwrap();
/// let (decoded, consumed) = decode_message(&bytes).unwrap();
/// assert_eq!(decoded, msg);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_message(
    msg: &SessionMessage,
    sequence_number: u64,
    timestamp_us: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let payload = encode_payload(msg)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            declared: payload.len(),
        });
    }
    let payload_len = payload.len() as u32;

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());

    buf.push(PROTOCOL_VERSION);
    buf.push(msg.message_type() as u8);
    buf.push(0x00); // reserved
    buf.push(0x00); // reserved
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(&sequence_number.to_be_bytes());
    buf.extend_from_slice(&timestamp_us.to_be_bytes());

    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encodes a [`SessionMessage`] using the current system time as the timestamp.
///
/// # Errors
///
/// Same as [`encode_message`].
pub fn encode_message_now(
    msg: &SessionMessage,
    sequence_number: u64,
) -> Result<Vec<u8>, ProtocolError> {
    let timestamp_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    encode_message(msg, sequence_number, timestamp_us)
}

/// Decodes one [`SessionMessage`] from the beginning of `bytes`.
///
/// Returns the decoded message and the total number of bytes consumed
/// (header + payload), so the caller can advance their read cursor.
///
/// A partial header or a partial payload both yield
/// [`ProtocolError::InsufficientData`]; an oversized declared payload is
/// rejected as soon as the header is available.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the bytes are incomplete or malformed.
pub fn decode_message(bytes: &[u8]) -> Result<(SessionMessage, usize), ProtocolError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let msg_type_byte = bytes[1];
    let msg_type = MessageType::try_from(msg_type_byte)
        .map_err(|_| ProtocolError::UnknownMessageType(msg_type_byte))?;

    // bytes[2..4] are reserved – ignored on decode

    let payload_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge {
            declared: payload_len,
        });
    }

    let total_needed = HEADER_SIZE + payload_len;
    if bytes.len() < total_needed {
        return Err(ProtocolError::InsufficientData {
            needed: total_needed,
            available: bytes.len(),
        });
    }

    let payload = &bytes[HEADER_SIZE..total_needed];
    let msg = decode_payload(msg_type, payload)?;
    Ok((msg, total_needed))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_payload(msg: &SessionMessage) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    match msg {
        SessionMessage::Hello(m) => {
            encode_identity(&mut buf, m.protocol_version, &m.device_id, &m.device_name)?
        }
        SessionMessage::Welcome(m) => {
            encode_identity(&mut buf, m.protocol_version, &m.device_id, &m.device_name)?
        }
        SessionMessage::Ping(token) => buf.extend_from_slice(&token.to_be_bytes()),
        SessionMessage::Pong(token) => buf.extend_from_slice(&token.to_be_bytes()),
        SessionMessage::Bye { reason } => buf.push(*reason as u8),
        SessionMessage::Error(m) => encode_error(&mut buf, m)?,
    }
    Ok(buf)
}

// ── Payload decoding ──────────────────────────────────────────────────────────

fn decode_payload(msg_type: MessageType, payload: &[u8]) -> Result<SessionMessage, ProtocolError> {
    match msg_type {
        MessageType::Hello => {
            let (protocol_version, device_id, device_name) = decode_identity(payload, "Hello")?;
            Ok(SessionMessage::Hello(HelloMessage {
                protocol_version,
                device_id,
                device_name,
            }))
        }
        MessageType::Welcome => {
            let (protocol_version, device_id, device_name) = decode_identity(payload, "Welcome")?;
            Ok(SessionMessage::Welcome(WelcomeMessage {
                protocol_version,
                device_id,
                device_name,
            }))
        }
        MessageType::Ping => read_u64(payload, "Ping").map(SessionMessage::Ping),
        MessageType::Pong => read_u64(payload, "Pong").map(SessionMessage::Pong),
        MessageType::Bye => {
            require_len(payload, 1, "Bye")?;
            let reason = DisconnectReason::try_from(payload[0]).map_err(|_| {
                ProtocolError::MalformedPayload(format!("unknown disconnect reason: {}", payload[0]))
            })?;
            Ok(SessionMessage::Bye { reason })
        }
        MessageType::Error => decode_error(payload).map(SessionMessage::Error),
    }
}

// ── Per-message helpers ───────────────────────────────────────────────────────

/// HELLO and WELCOME share a layout: version, id, name.
fn encode_identity(
    buf: &mut Vec<u8>,
    protocol_version: u8,
    device_id: &str,
    device_name: &str,
) -> Result<(), ProtocolError> {
    buf.push(protocol_version);
    write_length_prefixed_string(buf, device_id, "device_id")?;
    write_length_prefixed_string(buf, device_name, "device_name")
}

fn decode_identity(p: &[u8], context: &str) -> Result<(u8, String, String), ProtocolError> {
    // 1 (version) + 2 (id_len) + 2 (name_len)
    require_len(p, 5, context)?;
    let protocol_version = p[0];
    let (device_id, id_end) = read_length_prefixed_string(p, 1)?;
    let (device_name, _) = read_length_prefixed_string(p, id_end)?;
    Ok((protocol_version, device_id, device_name))
}

fn encode_error(buf: &mut Vec<u8>, m: &ErrorMessage) -> Result<(), ProtocolError> {
    buf.push(m.error_code as u8);
    write_length_prefixed_string(buf, &m.description, "description")
}

fn decode_error(p: &[u8]) -> Result<ErrorMessage, ProtocolError> {
    require_len(p, 3, "Error")?;
    let error_code = match p[0] {
        0x01 => ProtocolErrorCode::ProtocolVersionMismatch,
        0x02 => ProtocolErrorCode::InvalidHandshake,
        0x08 => ProtocolErrorCode::InvalidMessage,
        _ => ProtocolErrorCode::InternalError,
    };
    let (description, _) = read_length_prefixed_string(p, 1)?;
    Ok(ErrorMessage {
        error_code,
        description,
    })
}

// ── Utility helpers ───────────────────────────────────────────────────────────

fn require_len(buf: &[u8], needed: usize, context: &str) -> Result<(), ProtocolError> {
    if buf.len() < needed {
        Err(ProtocolError::MalformedPayload(format!(
            "{context}: need {needed} bytes, got {}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

fn read_u64(buf: &[u8], context: &str) -> Result<u64, ProtocolError> {
    require_len(buf, 8, context)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[..8]);
    Ok(u64::from_be_bytes(raw))
}

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
///
/// Strings longer than `u16::MAX` bytes are rejected, never cut.
fn write_length_prefixed_string(
    buf: &mut Vec<u8>,
    s: &str,
    field: &str,
) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len()).map_err(|_| {
        ProtocolError::MalformedPayload(format!(
            "{field} is {} bytes, longer than the {} byte limit",
            s.len(),
            u16::MAX
        ))
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Reads a 2-byte length prefix and then that many UTF-8 bytes.
/// Returns the string and the offset of the byte after the string.
fn read_length_prefixed_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    if buf.len() < offset + 2 {
        return Err(ProtocolError::MalformedPayload(format!(
            "need 2 bytes for string length at offset {offset}"
        )));
    }
    let len = u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize;
    let start = offset + 2;
    if buf.len() < start + len {
        return Err(ProtocolError::MalformedPayload(format!(
            "string of length {len} at offset {start} exceeds buffer"
        )));
    }
    let s = std::str::from_utf8(&buf[start..start + len])
        .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))?
        .to_string();
    Ok((s, start + len))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
