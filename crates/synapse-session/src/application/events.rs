//! Event bus: how the engine tells the outside world what happened.
//!
//! Four kinds of event leave the engine:
//!
//! | Event                 | Payload                  |
//! |-----------------------|--------------------------|
//! | `status`              | `{ role, connected }`    |
//! | `log`                 | human-readable line      |
//! | `device-connected`    | `{ device_id, device_name }` |
//! | `device-disconnected` | `device_id`              |
//!
//! # Delivery policy
//!
//! The bus is one `tokio::sync::broadcast` channel.  Each subscriber gets its
//! own bounded buffer; publishing never waits for a subscriber.  When a
//! subscriber falls more than `capacity` events behind, the oldest events in
//! its buffer are dropped and [`EventSubscriber::recv`] logs how many were
//! skipped before handing out the next one.  Every subscriber sees the events
//! it does receive in emission order.
//!
//! # Status publication
//!
//! [`StatusCell`] is the only place the role/connectivity pair is stored.
//! It emits `status` while still holding its lock, so the order of `status`
//! events always matches the order of the changes themselves.

use std::sync::{Mutex, MutexGuard, PoisonError};

use synapse_core::{DeviceId, DeviceInfo, SessionStatus};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default per-subscriber buffer size.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something the engine reports to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status(SessionStatus),
    Log(String),
    DeviceConnected(DeviceInfo),
    DeviceDisconnected(DeviceId),
}

impl SessionEvent {
    /// The event name used at the external boundary.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Status(_) => "status",
            SessionEvent::Log(_) => "log",
            SessionEvent::DeviceConnected(_) => "device-connected",
            SessionEvent::DeviceDisconnected(_) => "device-disconnected",
        }
    }
}

/// Publishing side of the bus.  Cheap to clone; every clone feeds the same
/// channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Creates a bus whose subscribers each buffer up to `capacity` events.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes `event` to every current subscriber.
    ///
    /// Having no subscribers is not an error; the event is simply dropped.
    pub fn emit(&self, event: SessionEvent) {
        if let SessionEvent::Log(line) = &event {
            info!(target: "synapse::log", "{line}");
        }
        let _ = self.tx.send(event);
    }

    /// Shorthand for emitting a [`SessionEvent::Log`].
    pub fn log(&self, line: impl Into<String>) {
        self.emit(SessionEvent::Log(line.into()));
    }

    /// Opens a new subscription that sees every event emitted from now on.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// Receiving side of the bus.
#[derive(Debug)]
pub struct EventSubscriber {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventSubscriber {
    /// Waits for the next event.
    ///
    /// Returns `None` once every [`EventBus`] clone has been dropped and the
    /// buffer is empty.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Holds the current [`SessionStatus`] and publishes every change.
#[derive(Debug)]
pub struct StatusCell {
    current: Mutex<SessionStatus>,
    events: EventBus,
}

impl StatusCell {
    pub fn new(events: EventBus) -> Self {
        Self {
            current: Mutex::new(SessionStatus::IDLE),
            events,
        }
    }

    pub fn get(&self) -> SessionStatus {
        *self.lock()
    }

    /// Replaces the status, emitting `status` if it changed.
    ///
    /// Returns `true` if an event was emitted.
    pub fn set(&self, next: SessionStatus) -> bool {
        let mut current = self.lock();
        if *current == next {
            return false;
        }
        *current = next;
        self.events.emit(SessionEvent::Status(next));
        true
    }

    /// Updates only the `connected` flag of the current role.
    ///
    /// Has no effect while idle.
    pub fn set_connected(&self, connected: bool) -> bool {
        let mut current = self.lock();
        let next = SessionStatus::new(current.role, connected);
        if *current == next {
            return false;
        }
        *current = next;
        self.events.emit(SessionEvent::Status(next));
        true
    }

    fn lock(&self) -> MutexGuard<'_, SessionStatus> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
