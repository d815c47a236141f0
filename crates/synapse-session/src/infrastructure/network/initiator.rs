//! Connection initiator: the client role's network side.
//!
//! Keeps exactly one outbound connection to the configured server:
//!
//! ```text
//!   ┌──► connect ──► handshake ──► keep-alive ──► lost ──┐
//!   │       │            │                               │
//!   │       └── fail ────┴───────────────────────────────┤
//!   │                                                    ▼
//!   └───────────────────────────────────── log, wait backoff
//! ```
//!
//! A link that drops right after its handshake counts as a failure too, so
//! a server that keeps evicting this client is retried on the same
//! schedule as one that refuses it.
//!
//! Failures never end the session.  Only cancellation does, or an attempt
//! cap in [`ReconnectConfig::max_attempts`], in which case the initiator
//! parks until cancelled and the role stays `Client` with
//! `connected = false`.
//!
//! The TCP connect step sits behind the [`Connector`] trait so the retry
//! loop can be driven without a network in tests.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use synapse_core::protocol::messages::DisconnectReason;
use synapse_core::DeviceInfo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::events::{EventBus, StatusCell};

use super::backoff::{Backoff, ReconnectConfig};
use super::framing::{FrameReader, FrameWriter};
use super::handshake::{initiate_handshake, HandshakeError, DEFAULT_HANDSHAKE_TIMEOUT};
use super::keepalive::{run_keepalive, send_goodbye, DisconnectCause, KeepaliveConfig};

/// Opens the raw TCP stream to the server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> io::Result<TcpStream>;
}

/// [`Connector`] that resolves `address` and connects with a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> io::Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("timed out after {:.1}s", self.connect_timeout.as_secs_f64()),
            )),
        }
    }
}

/// Timing for the client role.
#[derive(Debug, Clone)]
pub struct InitiatorConfig {
    pub handshake_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for InitiatorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: KeepaliveConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// State the initiator shares with the session controller.
#[derive(Debug, Clone)]
pub struct ClientContext {
    status: Arc<StatusCell>,
    events: EventBus,
    remote_peer: Arc<Mutex<Option<DeviceInfo>>>,
}

impl ClientContext {
    pub fn new(
        status: Arc<StatusCell>,
        events: EventBus,
        remote_peer: Arc<Mutex<Option<DeviceInfo>>>,
    ) -> Self {
        Self {
            status,
            events,
            remote_peer,
        }
    }

    fn set_peer(&self, peer: Option<DeviceInfo>) {
        *self
            .remote_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = peer;
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("{0}")]
    Connect(io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

type Established = (
    FrameReader<tokio::net::tcp::OwnedReadHalf>,
    FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    DeviceInfo,
);

/// Maintains the client's single outbound connection.
pub struct ConnectionInitiator<C: Connector> {
    connector: C,
    address: String,
    local: DeviceInfo,
    config: InitiatorConfig,
    context: ClientContext,
}

impl<C: Connector> ConnectionInitiator<C> {
    pub fn new(
        connector: C,
        address: impl Into<String>,
        local: DeviceInfo,
        config: InitiatorConfig,
        context: ClientContext,
    ) -> Self {
        Self {
            connector,
            address: address.into(),
            local,
            config,
            context,
        }
    }

    /// Connects, serves and reconnects until `cancel` fires.
    ///
    /// Every failed attempt and every lost link waits out the next backoff
    /// delay before reconnecting.  The backoff only starts over after a link
    /// that stayed up for a full liveness window.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            let attempt = backoff.failures() + 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.connect_once() => result,
            };

            let failure = match result {
                Ok((mut reader, mut writer, server)) => {
                    let connected_at = Instant::now();
                    let Some(cause) = self.serve(&mut reader, &mut writer, &server, &cancel).await
                    else {
                        break;
                    };
                    if connected_at.elapsed() >= self.config.keepalive.liveness_timeout {
                        backoff.reset();
                    }
                    warn!(address = %self.address, %cause, "connection lost");
                    format!("Connection to {server} lost: {cause}")
                }
                Err(e) => {
                    warn!(address = %self.address, attempt, error = %e, "connection attempt failed");
                    format!("Connection attempt {attempt} to {} failed: {e}", self.address)
                }
            };

            if !self.wait_before_retry(&mut backoff, failure, &cancel).await {
                break;
            }
        }

        self.context.set_peer(None);
        self.context.status.set_connected(false);
        debug!(address = %self.address, "initiator stopped");
    }

    /// Logs `failure` with the next backoff delay and sleeps it out.
    ///
    /// Returns `false` when the loop must end: the session was cancelled, or
    /// the attempt cap is exhausted, in which case this parks until cancel.
    async fn wait_before_retry(
        &self,
        backoff: &mut Backoff,
        failure: String,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(delay) = backoff.next_delay() else {
            self.context.events.log(format!("{failure}; giving up"));
            cancel.cancelled().await;
            return false;
        };
        self.context.events.log(format!(
            "{failure}; retrying in {:.1}s",
            delay.as_secs_f64()
        ));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn connect_once(&self) -> Result<Established, AttemptError> {
        let stream = self
            .connector
            .connect(&self.address)
            .await
            .map_err(AttemptError::Connect)?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(rd);
        let mut writer = FrameWriter::new(wr);
        let server = initiate_handshake(
            &mut reader,
            &mut writer,
            &self.local,
            self.config.handshake_timeout,
        )
        .await?;
        Ok((reader, writer, server))
    }

    /// Runs one established connection.  Returns the cause of the loss, or
    /// `None` if the session was cancelled.
    async fn serve(
        &self,
        reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
        server: &DeviceInfo,
        cancel: &CancellationToken,
    ) -> Option<DisconnectCause> {
        info!(address = %self.address, %server, "connected to server");
        self.context.set_peer(Some(server.clone()));
        self.context.status.set_connected(true);
        self.context.events.log(format!("Connected to {server}"));

        let cause = run_keepalive(reader, writer, self.config.keepalive, cancel).await;

        self.context.set_peer(None);
        self.context.status.set_connected(false);

        if let DisconnectCause::Cancelled = cause {
            send_goodbye(writer, DisconnectReason::UserInitiated).await;
            return None;
        }
        Some(cause)
    }
}
