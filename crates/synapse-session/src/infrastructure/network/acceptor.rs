//! Connection acceptor: the server role's network side.
//!
//! # Lifecycle of one connection
//!
//! ```text
//!  accept ──► handshake ──ok──► register ──► keep-alive ──► unregister ──► close
//!                 │
//!                 └─fail──► log rejection ──► close
//! ```
//!
//! Every connection runs in its own task inside a `JoinSet` owned by
//! [`ConnectionAcceptor::run`], with a child of the session's cancellation
//! token.  Cancelling the session therefore reaches every connection, while
//! an evicted connection can be closed on its own through its
//! [`ConnectionHandle`].
//!
//! # Event ordering
//!
//! [`ServerContext`] mutates the registry and emits the matching events
//! while holding the registry lock, so observers see:
//!
//! - `status {Server, true}` before the first `device-connected`;
//! - the last `device-disconnected` before `status {Server, false}`;
//! - on eviction, `device-disconnected(old)` before `device-connected(new)`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use synapse_core::protocol::messages::DisconnectReason;
use synapse_core::{DeviceId, DeviceInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::device_registry::{ConnectionHandle, ConnectionId, Device, DeviceRegistry};
use crate::application::events::{EventBus, SessionEvent, StatusCell};

use super::framing::{FrameReader, FrameWriter};
use super::handshake::{accept_handshake, DEFAULT_HANDSHAKE_TIMEOUT};
use super::keepalive::{run_keepalive, send_goodbye, DisconnectCause, KeepaliveConfig};

/// Pause after a failed `accept()` before trying again.
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Timing for the server role.
#[derive(Debug, Clone, Copy)]
pub struct AcceptorConfig {
    pub handshake_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    /// How long connection tasks get to finish after the session is
    /// cancelled before they are aborted.
    pub shutdown_grace: Duration,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: KeepaliveConfig::default(),
            shutdown_grace: Duration::from_millis(2500),
        }
    }
}

/// State the acceptor shares with its connection tasks and with the
/// session controller.
#[derive(Debug, Clone)]
pub struct ServerContext {
    registry: Arc<Mutex<DeviceRegistry>>,
    status: Arc<StatusCell>,
    events: EventBus,
}

impl ServerContext {
    pub fn new(
        registry: Arc<Mutex<DeviceRegistry>>,
        status: Arc<StatusCell>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            status,
            events,
        }
    }

    /// Adds a device that completed its handshake, evicting any stale entry
    /// with the same id.
    pub fn register(&self, device: Device) {
        let info = device.info.clone();
        let mut registry = self.lock_registry();
        let was_empty = registry.is_empty();

        if let Some(stale) = registry.insert(device) {
            stale.handle.close();
            warn!(
                device_id = %stale.info.device_id,
                stale_peer = %stale.handle.peer_addr(),
                "device reconnected; closing stale connection"
            );
            self.events
                .emit(SessionEvent::DeviceDisconnected(stale.info.device_id.clone()));
            self.events
                .log(format!("{} replaced by a newer connection", stale.info));
        }

        if was_empty {
            self.status.set_connected(true);
        }
        self.events.emit(SessionEvent::DeviceConnected(info));
    }

    /// Removes the device registered by `connection_id`.
    ///
    /// Returns `false` (and emits nothing) if the entry was already evicted
    /// or drained.
    pub fn unregister(&self, device_id: &str, connection_id: ConnectionId) -> bool {
        let mut registry = self.lock_registry();
        let Some(device) = registry.remove_connection(device_id, connection_id) else {
            return false;
        };
        self.events
            .emit(SessionEvent::DeviceDisconnected(device.info.device_id));
        if registry.is_empty() {
            self.status.set_connected(false);
        }
        true
    }

    /// Closes and removes every remaining device.
    pub fn drain(&self) -> Vec<DeviceId> {
        let mut registry = self.lock_registry();
        let drained = registry.drain();
        let ids: Vec<DeviceId> = drained
            .into_iter()
            .map(|device| {
                device.handle.close();
                self.events
                    .emit(SessionEvent::DeviceDisconnected(device.info.device_id.clone()));
                device.info.device_id
            })
            .collect();
        if !ids.is_empty() {
            self.status.set_connected(false);
        }
        ids
    }

    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.lock_registry().snapshot()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn lock_registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts and serves device connections until cancelled.
pub struct ConnectionAcceptor {
    listener: TcpListener,
    context: ServerContext,
    config: AcceptorConfig,
    local: DeviceInfo,
}

impl ConnectionAcceptor {
    /// Wraps an already-bound listener.
    pub fn new(
        listener: TcpListener,
        context: ServerContext,
        config: AcceptorConfig,
        local: DeviceInfo,
    ) -> Self {
        Self {
            listener,
            context,
            config,
            local,
        }
    }

    /// Runs the accept loop until `cancel` fires, then shuts every
    /// connection down and empties the registry.
    pub async fn run(self, cancel: CancellationToken) {
        let ConnectionAcceptor {
            listener,
            context,
            config,
            local,
        } = self;
        let local = Arc::new(local);
        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "connection task panicked");
                        }
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            context.clone(),
                            config,
                            Arc::clone(&local),
                            cancel.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => {}
                        }
                    }
                },
            }
        }

        drop(listener);
        info!(open = connections.len(), "acceptor stopping");

        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "connection tasks did not finish in time; aborting"
            );
            connections.shutdown().await;
        }

        context.drain();
    }
}

/// Serves one accepted connection from handshake to close.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: ServerContext,
    config: AcceptorConfig,
    local: Arc<DeviceInfo>,
    session: CancellationToken,
    cancel: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%peer, error = %e, "could not set TCP_NODELAY");
    }
    let (rd, wr) = stream.into_split();
    let mut reader = FrameReader::new(rd);
    let mut writer = FrameWriter::new(wr);

    let handshake = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = accept_handshake(&mut reader, &mut writer, &local, config.handshake_timeout) => result,
    };

    let info = match handshake {
        Ok(info) => info,
        Err(e) => {
            warn!(%peer, error = %e, "handshake rejected");
            context
                .events()
                .log(format!("Rejected connection from {peer}: {e}"));
            return;
        }
    };

    let handle = ConnectionHandle::new(peer, cancel.clone());
    let connection_id = handle.id();
    info!(%peer, device_id = %info.device_id, device_name = %info.device_name, "device connected");
    context.register(Device::new(info.clone(), handle));

    let cause = run_keepalive(&mut reader, &mut writer, config.keepalive, &cancel).await;

    if let DisconnectCause::Cancelled = cause {
        let reason = if session.is_cancelled() {
            DisconnectReason::ServerShutdown
        } else {
            DisconnectReason::Replaced
        };
        send_goodbye(&mut writer, reason).await;
    }

    if context.unregister(&info.device_id, connection_id) {
        info!(%peer, device_id = %info.device_id, %cause, "device disconnected");
        if !matches!(cause, DisconnectCause::Cancelled) {
            context.events().log(format!("{info} disconnected: {cause}"));
        }
    } else {
        debug!(%peer, device_id = %info.device_id, %cause, "stale connection closed");
    }
}
