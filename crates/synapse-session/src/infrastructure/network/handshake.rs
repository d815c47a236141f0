//! Connection handshake shared by both roles.
//!
//! ```text
//!   client                                server
//!     │ ── Hello { version, id, name } ──────► │  validate
//!     │ ◄───── Welcome { version, id, name } ─ │  (accepted)
//!     │ ◄───── Error { code, description } ─── │  (rejected, then close)
//! ```
//!
//! The server checks the protocol version (both the frame header and the
//! `Hello` body) and that the device id is non-empty.  Whatever the outcome,
//! the whole exchange must finish within the handshake timeout.
//!
//! Neither function watches a cancellation token; callers race them against
//! their token in a `tokio::select!`.

use std::io;
use std::time::Duration;

use synapse_core::protocol::messages::{
    ErrorMessage, HelloMessage, ProtocolErrorCode, WelcomeMessage, PROTOCOL_VERSION,
};
use synapse_core::{DeviceInfo, ProtocolError, SessionMessage};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::framing::{FrameError, FrameReader, FrameWriter};

/// Default time allowed for the whole exchange.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a handshake did not complete.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolMismatch { local: u8, remote: u8 },

    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("connection closed during handshake")]
    Closed,

    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for HandshakeError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => HandshakeError::Closed,
            FrameError::Io(e) => HandshakeError::Io(e),
            FrameError::Protocol(ProtocolError::UnsupportedVersion(remote)) => {
                HandshakeError::ProtocolMismatch {
                    local: PROTOCOL_VERSION,
                    remote,
                }
            }
            FrameError::Protocol(other) => HandshakeError::Malformed(other.to_string()),
        }
    }
}

impl HandshakeError {
    /// The `Error` frame the server sends before closing, if any.
    fn rejection(&self) -> Option<ErrorMessage> {
        let error_code = match self {
            HandshakeError::ProtocolMismatch { .. } => ProtocolErrorCode::ProtocolVersionMismatch,
            HandshakeError::Malformed(_) => ProtocolErrorCode::InvalidHandshake,
            _ => return None,
        };
        Some(ErrorMessage {
            error_code,
            description: self.to_string(),
        })
    }
}

/// Server side: waits for `Hello`, validates it and answers `Welcome`.
///
/// On a version mismatch or malformed `Hello` an `Error` frame is sent
/// (best effort) before the error is returned.
///
/// # Errors
///
/// Returns [`HandshakeError`] describing why the peer was not accepted.
pub async fn accept_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local: &DeviceInfo,
    timeout: Duration,
) -> Result<DeviceInfo, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, accept_exchange(reader, writer, local))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn accept_exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local: &DeviceInfo,
) -> Result<DeviceInfo, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match read_hello(reader).await {
        Ok(peer) => {
            let welcome = SessionMessage::Welcome(WelcomeMessage {
                protocol_version: PROTOCOL_VERSION,
                device_id: local.device_id.clone(),
                device_name: local.device_name.clone(),
            });
            writer.send(&welcome).await?;
            Ok(peer)
        }
        Err(e) => {
            if let Some(rejection) = e.rejection() {
                if let Err(send_err) = writer.send(&SessionMessage::Error(rejection)).await {
                    debug!(error = %send_err, "could not deliver handshake rejection");
                }
            }
            Err(e)
        }
    }
}

async fn read_hello<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<DeviceInfo, HandshakeError> {
    match reader.next_message().await? {
        Some(SessionMessage::Hello(HelloMessage {
            protocol_version,
            device_id,
            device_name,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(HandshakeError::ProtocolMismatch {
                    local: PROTOCOL_VERSION,
                    remote: protocol_version,
                });
            }
            if device_id.trim().is_empty() {
                return Err(HandshakeError::Malformed("empty device id".to_string()));
            }
            Ok(DeviceInfo::new(device_id, device_name))
        }
        Some(other) => Err(HandshakeError::Malformed(format!(
            "expected Hello, got {:?}",
            other.message_type()
        ))),
        None => Err(HandshakeError::Closed),
    }
}

/// Client side: sends `Hello` and waits for the server's `Welcome`.
///
/// Returns the server's identity.
///
/// # Errors
///
/// Returns [`HandshakeError::Rejected`] if the server answered with an
/// `Error` frame, or another [`HandshakeError`] variant on version mismatch,
/// malformed reply, timeout or connection loss.
pub async fn initiate_handshake<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local: &DeviceInfo,
    timeout: Duration,
) -> Result<DeviceInfo, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, initiate_exchange(reader, writer, local))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn initiate_exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    local: &DeviceInfo,
) -> Result<DeviceInfo, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let hello = SessionMessage::Hello(HelloMessage {
        protocol_version: PROTOCOL_VERSION,
        device_id: local.device_id.clone(),
        device_name: local.device_name.clone(),
    });
    writer.send(&hello).await?;

    match reader.next_message().await? {
        Some(SessionMessage::Welcome(welcome)) => {
            if welcome.protocol_version != PROTOCOL_VERSION {
                return Err(HandshakeError::ProtocolMismatch {
                    local: PROTOCOL_VERSION,
                    remote: welcome.protocol_version,
                });
            }
            if welcome.device_id.trim().is_empty() {
                return Err(HandshakeError::Malformed(
                    "server sent an empty device id".to_string(),
                ));
            }
            Ok(DeviceInfo::new(welcome.device_id, welcome.device_name))
        }
        Some(SessionMessage::Error(err)) => Err(HandshakeError::Rejected(err.description)),
        Some(other) => Err(HandshakeError::Malformed(format!(
            "expected Welcome, got {:?}",
            other.message_type()
        ))),
        None => Err(HandshakeError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::encode_message;
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    fn pipe() -> (
        FrameReader<ReadHalf<DuplexStream>>,
        FrameWriter<WriteHalf<DuplexStream>>,
        DuplexStream,
    ) {
        let (ours, theirs) = duplex(4096);
        let (rd, wr) = split(ours);
        (FrameReader::new(rd), FrameWriter::new(wr), theirs)
    }

    fn local() -> DeviceInfo {
        DeviceInfo::new("server-1", "Server")
    }

    async fn send_raw(peer: &mut DuplexStream, msg: &SessionMessage) {
        let bytes = encode_message(msg, 0, 0).unwrap();
        peer.write_all(&bytes).await.unwrap();
    }

    async fn read_one(peer: &mut DuplexStream) -> SessionMessage {
        let mut reader = FrameReader::new(peer);
        reader.next_message().await.unwrap().expect("a frame")
    }

    #[tokio::test]
    async fn test_accept_valid_hello_replies_welcome_with_local_identity() {
        // Arrange
        let (mut reader, mut writer, mut peer) = pipe();
        send_raw(
            &mut peer,
            &SessionMessage::Hello(HelloMessage {
                protocol_version: PROTOCOL_VERSION,
                device_id: "laptop".into(),
                device_name: "Laptop".into(),
            }),
        )
        .await;

        // Act
        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(1)).await;

        // Assert
        assert_eq!(result.unwrap(), DeviceInfo::new("laptop", "Laptop"));
        match read_one(&mut peer).await {
            SessionMessage::Welcome(w) => {
                assert_eq!(w.device_id, "server-1");
                assert_eq!(w.device_name, "Server");
            }
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_rejects_version_mismatch_with_error_frame() {
        // Arrange
        let (mut reader, mut writer, mut peer) = pipe();
        send_raw(
            &mut peer,
            &SessionMessage::Hello(HelloMessage {
                protocol_version: PROTOCOL_VERSION + 1,
                device_id: "laptop".into(),
                device_name: "Laptop".into(),
            }),
        )
        .await;

        // Act
        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(1)).await;

        // Assert
        assert!(matches!(
            result,
            Err(HandshakeError::ProtocolMismatch { remote, .. }) if remote == PROTOCOL_VERSION + 1
        ));
        match read_one(&mut peer).await {
            SessionMessage::Error(e) => {
                assert_eq!(e.error_code, ProtocolErrorCode::ProtocolVersionMismatch)
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_rejects_foreign_header_version() {
        let (mut reader, mut writer, mut peer) = pipe();
        let mut bytes = encode_message(&SessionMessage::Ping(0), 0, 0).unwrap();
        bytes[0] = 0x7F;
        peer.write_all(&bytes).await.unwrap();

        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(1)).await;

        assert!(matches!(
            result,
            Err(HandshakeError::ProtocolMismatch { remote: 0x7F, .. })
        ));
    }

    #[tokio::test]
    async fn test_accept_rejects_empty_device_id() {
        let (mut reader, mut writer, mut peer) = pipe();
        send_raw(
            &mut peer,
            &SessionMessage::Hello(HelloMessage {
                protocol_version: PROTOCOL_VERSION,
                device_id: String::new(),
                device_name: "Nameless".into(),
            }),
        )
        .await;

        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(1)).await;

        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
        match read_one(&mut peer).await {
            SessionMessage::Error(e) => assert_eq!(e.error_code, ProtocolErrorCode::InvalidHandshake),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_accept_rejects_non_hello_first_frame() {
        let (mut reader, mut writer, mut peer) = pipe();
        send_raw(&mut peer, &SessionMessage::Ping(1)).await;

        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(1)).await;

        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_times_out_on_silent_peer() {
        let (mut reader, mut writer, _peer) = pipe();

        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(5)).await;

        assert!(matches!(result, Err(HandshakeError::Timeout(d)) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_accept_reports_closed_when_peer_hangs_up() {
        let (mut reader, mut writer, peer) = pipe();
        drop(peer);

        let result =
            accept_handshake(&mut reader, &mut writer, &local(), Duration::from_secs(1)).await;

        assert!(matches!(result, Err(HandshakeError::Closed)));
    }

    #[tokio::test]
    async fn test_initiate_returns_server_identity() {
        // Arrange
        let (mut reader, mut writer, mut peer) = pipe();
        let server = tokio::spawn(async move {
            let hello = read_one(&mut peer).await;
            send_raw(
                &mut peer,
                &SessionMessage::Welcome(WelcomeMessage {
                    protocol_version: PROTOCOL_VERSION,
                    device_id: "desk".into(),
                    device_name: "Desk".into(),
                }),
            )
            .await;
            hello
        });

        // Act
        let me = DeviceInfo::new("laptop", "Laptop");
        let result =
            initiate_handshake(&mut reader, &mut writer, &me, Duration::from_secs(1)).await;

        // Assert
        assert_eq!(result.unwrap(), DeviceInfo::new("desk", "Desk"));
        match server.await.unwrap() {
            SessionMessage::Hello(h) => assert_eq!(h.device_id, "laptop"),
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initiate_surfaces_server_rejection() {
        let (mut reader, mut writer, mut peer) = pipe();
        tokio::spawn(async move {
            let mut header = [0u8; 64];
            let _ = peer.read(&mut header).await;
            send_raw(
                &mut peer,
                &SessionMessage::Error(ErrorMessage {
                    error_code: ProtocolErrorCode::ProtocolVersionMismatch,
                    description: "too old".into(),
                }),
            )
            .await;
            peer
        });

        let result = initiate_handshake(
            &mut reader,
            &mut writer,
            &DeviceInfo::new("laptop", "Laptop"),
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(HandshakeError::Rejected(d)) if d == "too old"));
    }

    #[test]
    fn test_header_version_error_maps_to_protocol_mismatch() {
        let err: HandshakeError = FrameError::Protocol(ProtocolError::UnsupportedVersion(9)).into();
        assert!(matches!(
            err,
            HandshakeError::ProtocolMismatch { local: PROTOCOL_VERSION, remote: 9 }
        ));
    }
}
