//! Device registry: the server's live view of who is connected.
//!
//! Every entry pairs the identity a peer declared in its `Hello` with a
//! [`ConnectionHandle`] for the socket that carried it.  An entry exists
//! exactly as long as that connection is open.
//!
//! # Identity collisions
//!
//! Device ids are chosen by the peers, so two connections can claim the same
//! one (typically a device that reconnected before its old socket timed out).
//! The newest connection wins: [`DeviceRegistry::insert`] hands back the stale
//! entry so the caller can close it and report the disconnect.
//!
//! Connection tasks always remove their own entry through
//! [`DeviceRegistry::remove_connection`], which checks the connection id.
//! That way a task whose entry was already replaced cannot remove the entry
//! of the connection that replaced it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use synapse_core::DeviceInfo;
use tokio_util::sync::CancellationToken;

/// Process-unique identifier of one accepted connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to one open connection.
///
/// Cloning the handle does not duplicate the connection; every clone closes
/// the same socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Creates a handle with a fresh [`ConnectionId`].
    ///
    /// `cancel` must be the token the connection task is watching.
    pub fn new(peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Asks the connection task to say goodbye and close its socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A registered device.
#[derive(Debug, Clone)]
pub struct Device {
    pub info: DeviceInfo,
    pub handle: ConnectionHandle,
}

impl Device {
    pub fn new(info: DeviceInfo, handle: ConnectionHandle) -> Self {
        Self { info, handle }
    }

    pub fn device_id(&self) -> &str {
        &self.info.device_id
    }
}

/// Registered devices in the order they connected.
///
/// The registry itself is not synchronised; the acceptor shares it behind a
/// `std::sync::Mutex` so every mutation and snapshot is linearised.
///
/// # Vec choice
///
/// A server rarely sees more than a handful of devices, and the snapshot
/// must come out in connection order, so a `Vec` with linear lookup beats a
/// map plus a separate ordering index.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `device`, returning the entry it evicted, if any.
    ///
    /// A replacing insert appends the new entry at the end; it represents a
    /// new connection, not an update of the old one.
    pub fn insert(&mut self, device: Device) -> Option<Device> {
        let evicted = self.remove(device.device_id());
        self.devices.push(device);
        evicted
    }

    /// Removes the entry for `device_id` regardless of which connection owns it.
    pub fn remove(&mut self, device_id: &str) -> Option<Device> {
        let index = self
            .devices
            .iter()
            .position(|d| d.device_id() == device_id)?;
        Some(self.devices.remove(index))
    }

    /// Removes the entry for `device_id` only if it belongs to `connection_id`.
    pub fn remove_connection(
        &mut self,
        device_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Device> {
        let index = self
            .devices
            .iter()
            .position(|d| d.device_id() == device_id && d.handle.id() == connection_id)?;
        Some(self.devices.remove(index))
    }

    #[cfg(test)]
    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_id() == device_id)
    }

    #[cfg(test)]
    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    /// Returns the identities of all registered devices in connection order.
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(|d| d.info.clone()).collect()
    }

    #[cfg(test)]
    pub fn device_ids(&self) -> Vec<synapse_core::DeviceId> {
        self.devices.iter().map(|d| d.info.device_id.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Removes and returns every entry, oldest first.
    pub fn drain(&mut self) -> Vec<Device> {
        std::mem::take(&mut self.devices)
    }
}
