//! Role, status and device identity.
//!
//! # Role lifecycle
//!
//! ```text
//!            start_server            stop
//!   Idle  ───────────────►  Server ───────►  Idle
//!     │
//!     │      start_client            stop
//!     └──────────────────►  Client ───────►  Idle
//! ```
//!
//! Switching from Server to Client (or back) always passes through Idle.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, peer-chosen device identifier.
pub type DeviceId = String;

/// The mutually exclusive operating mode of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    Idle,
    Server,
    Client,
}

impl Role {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    ///
    /// Only `Idle → Server`, `Idle → Client`, `Server → Idle` and
    /// `Client → Idle` are allowed.
    pub fn can_transition_to(self, next: Role) -> bool {
        matches!(
            (self, next),
            (Role::Idle, Role::Server)
                | (Role::Idle, Role::Client)
                | (Role::Server, Role::Idle)
                | (Role::Client, Role::Idle)
        )
    }

    pub fn is_idle(self) -> bool {
        self == Role::Idle
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Idle => "idle",
            Role::Server => "server",
            Role::Client => "client",
        };
        f.write_str(s)
    }
}

/// Snapshot of the node's role and connectivity.
///
/// `connected` means "at least one device registered" for a server and
/// "handshake complete" for a client.  It is always `false` while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStatus {
    pub role: Role,
    pub connected: bool,
}

impl SessionStatus {
    pub const IDLE: SessionStatus = SessionStatus {
        role: Role::Idle,
        connected: false,
    };

    pub fn new(role: Role, connected: bool) -> Self {
        Self {
            role,
            connected: connected && !role.is_idle(),
        }
    }
}

/// Identity a peer declared during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub device_name: String,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<DeviceId>, device_name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device_name, self.device_id)
    }
}
