//! Session controller: the one place where the node's role changes.
//!
//! # Control operations
//!
//! | Operation      | From role | To role | Errors                               |
//! |----------------|-----------|---------|--------------------------------------|
//! | `start_server` | Idle      | Server  | `InvalidState`, `BindError`, `Busy`  |
//! | `start_client` | Idle      | Client  | `InvalidState`, `InvalidAddress`, `Busy` |
//! | `stop`         | any       | Idle    | none                                 |
//!
//! Control operations are serialised by an async mutex.  `start_*` only
//! tries the lock and fails with [`SessionError::Busy`] if another operation
//! holds it; `stop` waits, so it can be called at any moment.
//!
//! # Stop sequence
//!
//! 1. cancel the session token (reaches every connection through child
//!    tokens);
//! 2. wait for the session task up to the shutdown deadline, then abort it;
//! 3. drain whatever is left in the registry, emitting
//!    `device-disconnected` for each entry;
//! 4. emit `log "Stopped"` and finally `status {Idle, false}`.
//!
//! The terminal `status` is the last event of the session and is emitted
//! before `stop` returns.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use synapse_core::{DeviceInfo, Role, SessionStatus};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::device_registry::DeviceRegistry;
use crate::application::events::{EventBus, EventSubscriber, StatusCell, DEFAULT_EVENT_CAPACITY};
use crate::infrastructure::network::acceptor::{AcceptorConfig, ConnectionAcceptor, ServerContext};
use crate::infrastructure::network::address;
use crate::infrastructure::network::backoff::ReconnectConfig;
use crate::infrastructure::network::handshake::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::infrastructure::network::initiator::{
    ClientContext, ConnectionInitiator, InitiatorConfig, TcpConnector,
};
use crate::infrastructure::network::keepalive::KeepaliveConfig;

/// Errors returned by control operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A start was requested while a role is already active.
    #[error("cannot start: session is already running as {current}")]
    InvalidState { current: Role },

    /// The server could not bind its listening socket.
    #[error("failed to bind {addr}: {source}")]
    BindError {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The client's server address is not `host:port`.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Another control operation is in progress.
    #[error("another start or stop is in progress")]
    Busy,
}

/// Timing and sizing knobs for a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub keepalive: KeepaliveConfig,
    pub connect_timeout: Duration,
    /// Upper bound on how long `stop` may take.
    pub shutdown_deadline: Duration,
    pub reconnect: ReconnectConfig,
    pub event_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive: KeepaliveConfig::default(),
            connect_timeout: Duration::from_secs(5),
            shutdown_deadline: Duration::from_secs(5),
            reconnect: ReconnectConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SessionSettings {
    fn acceptor_config(&self) -> AcceptorConfig {
        AcceptorConfig {
            handshake_timeout: self.handshake_timeout,
            keepalive: self.keepalive,
            shutdown_grace: self.shutdown_deadline / 2,
        }
    }

    fn initiator_config(&self) -> InitiatorConfig {
        InitiatorConfig {
            handshake_timeout: self.handshake_timeout,
            keepalive: self.keepalive,
            reconnect: self.reconnect.clone(),
        }
    }
}

/// The running role's task and the token that stops it.
struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    listen_addr: Option<SocketAddr>,
}

/// Owns the role state machine and everything a running role needs.
pub struct SessionController {
    control: tokio::sync::Mutex<()>,
    status: Arc<StatusCell>,
    events: EventBus,
    registry: Arc<Mutex<DeviceRegistry>>,
    remote_peer: Arc<Mutex<Option<DeviceInfo>>>,
    active: Mutex<Option<ActiveSession>>,
    local: DeviceInfo,
    settings: SessionSettings,
}

impl SessionController {
    /// Creates an idle controller that identifies itself to peers as `local`.
    pub fn new(local: DeviceInfo, settings: SessionSettings) -> Self {
        let events = EventBus::new(settings.event_capacity);
        Self {
            control: tokio::sync::Mutex::new(()),
            status: Arc::new(StatusCell::new(events.clone())),
            events,
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            remote_peer: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
            local,
            settings,
        }
    }

    /// Binds `bind_address` and starts accepting devices.
    ///
    /// An empty address binds `0.0.0.0:24800`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Busy`] if another control operation is running.
    /// - [`SessionError::InvalidState`] if a role is already active.
    /// - [`SessionError::BindError`] if the socket cannot be bound; the role
    ///   stays `Idle` and no event is emitted.
    pub async fn start_server(&self, bind_address: &str) -> Result<(), SessionError> {
        let _guard = self.control.try_lock().map_err(|_| SessionError::Busy)?;
        self.ensure_can_start(Role::Server)?;

        let addr = address::bind_address(bind_address).map_err(|e| SessionError::BindError {
            addr: bind_address.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| SessionError::BindError {
                addr: addr.clone(),
                source,
            })?;
        let listen_addr = listener.local_addr().ok();

        self.status.set(SessionStatus::new(Role::Server, false));
        let shown = listen_addr.map_or(addr.clone(), |a| a.to_string());
        info!(addr = %shown, "server started");
        self.events.log(format!("Server listening on {shown}"));

        let context = ServerContext::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.status),
            self.events.clone(),
        );
        let acceptor = ConnectionAcceptor::new(
            listener,
            context,
            self.settings.acceptor_config(),
            self.local.clone(),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(acceptor.run(cancel.clone()));
        *self.lock_active() = Some(ActiveSession {
            cancel,
            task,
            listen_addr,
        });
        Ok(())
    }

    /// Starts maintaining a connection to `server_address`.
    ///
    /// Only the `host:port` syntax is checked here; resolution and connect
    /// failures are retried in the background and reported as `log` events.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Busy`] if another control operation is running.
    /// - [`SessionError::InvalidState`] if a role is already active.
    /// - [`SessionError::InvalidAddress`] if the address is malformed.
    pub async fn start_client(&self, server_address: &str) -> Result<(), SessionError> {
        let _guard = self.control.try_lock().map_err(|_| SessionError::Busy)?;
        self.ensure_can_start(Role::Client)?;

        let target = address::target_address(server_address)
            .map_err(|e| SessionError::InvalidAddress(e.to_string()))?;

        self.status.set(SessionStatus::new(Role::Client, false));
        info!(server = %target, "client started");
        self.events.log(format!("Connecting to {target}"));

        let context = ClientContext::new(
            Arc::clone(&self.status),
            self.events.clone(),
            Arc::clone(&self.remote_peer),
        );
        let initiator = ConnectionInitiator::new(
            TcpConnector::new(self.settings.connect_timeout),
            target,
            self.local.clone(),
            self.settings.initiator_config(),
            context,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(initiator.run(cancel.clone()));
        *self.lock_active() = Some(ActiveSession {
            cancel,
            task,
            listen_addr: None,
        });
        Ok(())
    }

    /// Stops the active role and returns to `Idle`.
    ///
    /// Idempotent: calling it while idle succeeds without emitting anything.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let _guard = self.control.lock().await;
        let Some(active) = self.lock_active().take() else {
            return Ok(());
        };

        let role = self.status.get().role;
        info!(%role, "stopping session");
        active.cancel.cancel();

        let mut task = active.task;
        if tokio::time::timeout(self.settings.shutdown_deadline, &mut task)
            .await
            .is_err()
        {
            warn!(
                deadline = ?self.settings.shutdown_deadline,
                "session task did not stop in time; aborting"
            );
            task.abort();
            let _ = task.await;
        }

        ServerContext::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.status),
            self.events.clone(),
        )
        .drain();
        *self
            .remote_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        self.events.log("Stopped");
        self.status.set(SessionStatus::IDLE);
        Ok(())
    }

    pub fn get_status(&self) -> SessionStatus {
        self.status.get()
    }

    /// Devices currently registered with the server, oldest first.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// The server this client is connected to, if any.
    pub fn remote_peer(&self) -> Option<DeviceInfo> {
        self.remote_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The address the server is actually listening on.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.lock_active().as_ref().and_then(|a| a.listen_addr)
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn local_identity(&self) -> &DeviceInfo {
        &self.local
    }

    fn ensure_can_start(&self, next: Role) -> Result<(), SessionError> {
        let current = self.status.get().role;
        if current.can_transition_to(next) {
            Ok(())
        } else {
            Err(SessionError::InvalidState { current })
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.lock_active().take() {
            active.cancel.cancel();
            active.task.abort();
        }
    }
}
