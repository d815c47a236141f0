//! Post-handshake liveness loop.
//!
//! Once a connection is established both ends run [`run_keepalive`]: it
//! sends `Ping` every `ping_interval`, answers every `Ping` with a `Pong`,
//! and treats any inbound frame as proof of life.  If nothing arrives for
//! `liveness_timeout` the connection is considered lost.
//!
//! The loop returns a [`DisconnectCause`] and never sends `Bye` itself;
//! when it returns [`DisconnectCause::Cancelled`] the caller picks the
//! goodbye reason and calls [`send_goodbye`].

use std::fmt;
use std::io;
use std::time::Duration;

use synapse_core::protocol::messages::DisconnectReason;
use synapse_core::SessionMessage;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::framing::{FrameError, FrameReader, FrameWriter};

/// Upper bound on how long a best-effort `Bye` may take.
const GOODBYE_TIMEOUT: Duration = Duration::from_millis(250);

/// Timing for the liveness loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub ping_interval: Duration,
    pub liveness_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(2),
            liveness_timeout: Duration::from_secs(6),
        }
    }
}

/// Why an established connection ended.
#[derive(Debug)]
pub enum DisconnectCause {
    /// The peer closed the stream without a `Bye`.
    PeerClosed,
    /// The peer said goodbye.
    Goodbye(DisconnectReason),
    /// No frame arrived within the liveness timeout.
    LivenessTimeout(Duration),
    /// The peer sent something that is not valid at this stage.
    Protocol(String),
    Io(io::Error),
    /// The local side asked the connection to close.
    Cancelled,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectCause::PeerClosed => f.write_str("connection closed by peer"),
            DisconnectCause::Goodbye(reason) => write!(f, "peer disconnected ({reason:?})"),
            DisconnectCause::LivenessTimeout(d) => {
                write!(f, "no traffic for {:.1}s", d.as_secs_f64())
            }
            DisconnectCause::Protocol(detail) => write!(f, "protocol error: {detail}"),
            DisconnectCause::Io(e) => write!(f, "i/o error: {e}"),
            DisconnectCause::Cancelled => f.write_str("closed locally"),
        }
    }
}

impl From<FrameError> for DisconnectCause {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                DisconnectCause::PeerClosed
            }
            FrameError::Io(e) => DisconnectCause::Io(e),
            FrameError::Protocol(e) => DisconnectCause::Protocol(e.to_string()),
        }
    }
}

/// Runs the ping/pong loop until the connection ends or `cancel` fires.
pub async fn run_keepalive<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: KeepaliveConfig,
    cancel: &CancellationToken,
) -> DisconnectCause
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut ticker = time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let liveness = time::sleep(config.liveness_timeout);
    tokio::pin!(liveness);

    let mut ping_token: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return DisconnectCause::Cancelled,

            _ = &mut liveness => {
                return DisconnectCause::LivenessTimeout(config.liveness_timeout);
            }

            _ = ticker.tick() => {
                ping_token = ping_token.wrapping_add(1);
                trace!(token = ping_token, "sending ping");
                if let Err(e) = writer.send(&SessionMessage::Ping(ping_token)).await {
                    return e.into();
                }
            }

            frame = reader.next_message() => {
                let msg = match frame {
                    Ok(Some(msg)) => msg,
                    Ok(None) => return DisconnectCause::PeerClosed,
                    Err(e) => return e.into(),
                };
                liveness
                    .as_mut()
                    .reset(Instant::now() + config.liveness_timeout);

                match msg {
                    SessionMessage::Ping(token) => {
                        if let Err(e) = writer.send(&SessionMessage::Pong(token)).await {
                            return e.into();
                        }
                    }
                    SessionMessage::Pong(token) => trace!(token, "pong received"),
                    SessionMessage::Bye { reason } => return DisconnectCause::Goodbye(reason),
                    SessionMessage::Error(err) => {
                        return DisconnectCause::Protocol(format!(
                            "peer reported {:?}: {}",
                            err.error_code, err.description
                        ));
                    }
                    other => {
                        return DisconnectCause::Protocol(format!(
                            "unexpected {:?} after handshake",
                            other.message_type()
                        ));
                    }
                }
            }
        }
    }
}

/// Sends `Bye { reason }` and shuts the write half down, giving up after a
/// short timeout so an unresponsive peer cannot stall shutdown.
pub async fn send_goodbye<W>(writer: &mut FrameWriter<W>, reason: DisconnectReason)
where
    W: AsyncWrite + Unpin,
{
    let goodbye = async {
        writer.send(&SessionMessage::Bye { reason }).await?;
        writer.shutdown().await?;
        Ok::<(), FrameError>(())
    };
    match time::timeout(GOODBYE_TIMEOUT, goodbye).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "goodbye not delivered"),
        Err(_) => debug!("goodbye timed out"),
    }
}
