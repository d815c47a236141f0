//! Command/event bridge: the engine as a frontend sees it.
//!
//! A frontend (desktop shell, CLI, test harness) talks to the engine through
//! exactly two channels:
//!
//! - **commands** – `start_server`, `start_client`, `stop`, `get_status`,
//!   exposed here as async functions returning [`CommandResult`];
//! - **events** – every [`SessionEvent`] converted to a [`BridgeEvent`]: a
//!   channel name (`synapse://status`, `synapse://log`,
//!   `synapse://device-connected`, `synapse://device-disconnected`) and a
//!   JSON payload.
//!
//! # `CommandResult<T>` wrapper
//!
//! Every command response has the same shape:
//! `{ success: bool, data: T | null, error: string | null }`, so a frontend
//! can check `result.success` without wrapping each call in a try/catch.
//!
//! # Payloads
//!
//! | Channel                         | Payload                                  |
//! |---------------------------------|------------------------------------------|
//! | `synapse://status`              | `{ role, connected, devices }`           |
//! | `synapse://log`                 | string                                   |
//! | `synapse://device-connected`    | `{ device_id, device_name }`             |
//! | `synapse://device-disconnected` | device id string                         |
//!
//! `role` is `"Idle"`, `"Server"` or `"Client"`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use synapse_core::{DeviceInfo, Role, SessionStatus};

use crate::application::events::SessionEvent;
use crate::application::session_controller::SessionController;

/// Prefix shared by every event channel name.
pub const EVENT_PREFIX: &str = "synapse://";

// ── Data Transfer Objects ─────────────────────────────────────────────────────

/// One registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDto {
    pub device_id: String,
    pub device_name: String,
}

impl From<&DeviceInfo> for DeviceDto {
    fn from(d: &DeviceInfo) -> Self {
        Self {
            device_id: d.device_id.clone(),
            device_name: d.device_name.clone(),
        }
    }
}

/// Role and connectivity, plus the server's device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDto {
    pub role: Role,
    pub connected: bool,
    pub devices: Vec<DeviceDto>,
}

impl StatusDto {
    fn new(status: SessionStatus, devices: &[DeviceInfo]) -> Self {
        Self {
            role: status.role,
            connected: status.connected,
            devices: devices.iter().map(DeviceDto::from).collect(),
        }
    }
}

/// Unified response wrapper used by every command.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// An event ready to hand to a frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEvent {
    pub channel: String,
    pub payload: Value,
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Starts the server role.
///
/// # Example (frontend)
/// ```ts
/// const res = await invoke('start_server', { bindAddress: '0.0.0.0:24800' });
/// ```
pub async fn start_server(
    controller: Arc<SessionController>,
    bind_address: String,
) -> CommandResult<()> {
    match controller.start_server(&bind_address).await {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Starts the client role.
pub async fn start_client(
    controller: Arc<SessionController>,
    server_address: String,
) -> CommandResult<()> {
    match controller.start_client(&server_address).await {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Stops whatever role is active.  Always succeeds.
pub async fn stop(controller: Arc<SessionController>) -> CommandResult<()> {
    match controller.stop().await {
        Ok(()) => CommandResult::ok(()),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

/// Returns the current status and device list.
pub async fn get_status(controller: Arc<SessionController>) -> CommandResult<StatusDto> {
    let status = controller.get_status();
    let devices = status_devices(status, controller.devices());
    CommandResult::ok(StatusDto::new(status, &devices))
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Picks the device list to publish next to `status`.
///
/// `snapshot` is read after the status, so it may already reflect a later
/// connect or disconnect.  It is only attached while the status says the
/// server has devices, so an idle, client or disconnected status never
/// carries a device list.
pub fn status_devices(status: SessionStatus, snapshot: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    if status.role == Role::Server && status.connected {
        snapshot
    } else {
        Vec::new()
    }
}

/// Converts an engine event into its channel name and JSON payload.
///
/// `devices` is the registry snapshot attached to `status` payloads.
pub fn to_bridge_event(event: &SessionEvent, devices: &[DeviceInfo]) -> BridgeEvent {
    let payload = match event {
        SessionEvent::Status(status) => json_value(&StatusDto::new(*status, devices)),
        SessionEvent::Log(line) => Value::String(line.clone()),
        SessionEvent::DeviceConnected(info) => json_value(&DeviceDto::from(info)),
        SessionEvent::DeviceDisconnected(id) => Value::String(id.clone()),
    };
    BridgeEvent {
        channel: format!("{EVENT_PREFIX}{}", event.name()),
        payload,
    }
}

fn json_value<T: Serialize>(value: &T) -> Value {
    // DTOs are plain strings, bools and vectors; serialisation cannot fail.
    serde_json::to_value(value).unwrap_or(Value::Null)
}
