//! TOML engine configuration.
//!
//! Read from the platform-appropriate config file:
//! - Windows:  `%APPDATA%\Synapse\config.toml`
//! - Linux:    `$XDG_CONFIG_HOME/synapse/config.toml` (or `~/.config/synapse`)
//! - macOS:    `~/Library/Application Support/Synapse/config.toml`
//!
//! The engine never writes this file.  A missing file means "all defaults",
//! and every field may be omitted:
//!
//! ```toml
//! [node]
//! device_name = "Desk"
//! log_level = "debug"
//!
//! [network]
//! bind_address = "0.0.0.0:24800"
//! ping_interval_ms = 2000
//!
//! [reconnect]
//! max_backoff_ms = 30000
//! max_attempts = 10
//! ```
//!
//! Durations are stored as integer milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use synapse_core::DeviceInfo;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::application::events::DEFAULT_EVENT_CAPACITY;
use crate::application::session_controller::SessionSettings;
use crate::infrastructure::network::address::DEFAULT_BIND_ADDRESS;
use crate::infrastructure::network::backoff::ReconnectConfig;
use crate::infrastructure::network::keepalive::KeepaliveConfig;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but makes no sense (zero interval, inverted bounds, ...).
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub events: EventsConfig,
}

/// How this node identifies itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Stable device id.  Generated per run when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Display name.  Defaults to the host name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Socket and timing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Bind address used by `synapse server` without `--bind`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,
}

/// Client retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Event bus sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_ping_interval_ms() -> u64 {
    2_000
}
fn default_liveness_timeout_ms() -> u64 {
    6_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_deadline_ms() -> u64 {
    5_000
}
fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            device_name: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            shutdown_deadline_ms: default_shutdown_deadline_ms(),
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Checks values serde cannot: non-zero timings and sane bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = &self.network;
        for (field, value) in [
            ("network.handshake_timeout_ms", n.handshake_timeout_ms),
            ("network.ping_interval_ms", n.ping_interval_ms),
            ("network.liveness_timeout_ms", n.liveness_timeout_ms),
            ("network.connect_timeout_ms", n.connect_timeout_ms),
            ("network.shutdown_deadline_ms", n.shutdown_deadline_ms),
            ("reconnect.initial_backoff_ms", self.reconnect.initial_backoff_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if n.liveness_timeout_ms <= n.ping_interval_ms {
            return Err(ConfigError::Invalid {
                field: "network.liveness_timeout_ms",
                reason: format!(
                    "must exceed ping_interval_ms ({} <= {})",
                    n.liveness_timeout_ms, n.ping_interval_ms
                ),
            });
        }
        let r = &self.reconnect;
        if r.max_backoff_ms < r.initial_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "reconnect.max_backoff_ms",
                reason: "must not be smaller than initial_backoff_ms".to_string(),
            });
        }
        if !(r.multiplier.is_finite() && r.multiplier >= 1.0) {
            return Err(ConfigError::Invalid {
                field: "reconnect.multiplier",
                reason: format!("must be a finite number >= 1.0, got {}", r.multiplier),
            });
        }
        if r.max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                field: "reconnect.max_attempts",
                reason: "must be at least 1 (omit it to retry forever)".to_string(),
            });
        }
        Ok(())
    }

    /// Converts the file representation into controller settings.
    pub fn session_settings(&self) -> SessionSettings {
        let n = &self.network;
        let r = &self.reconnect;
        SessionSettings {
            handshake_timeout: Duration::from_millis(n.handshake_timeout_ms),
            keepalive: KeepaliveConfig {
                ping_interval: Duration::from_millis(n.ping_interval_ms),
                liveness_timeout: Duration::from_millis(n.liveness_timeout_ms),
            },
            connect_timeout: Duration::from_millis(n.connect_timeout_ms),
            shutdown_deadline: Duration::from_millis(n.shutdown_deadline_ms),
            reconnect: ReconnectConfig {
                initial_backoff: Duration::from_millis(r.initial_backoff_ms),
                max_backoff: Duration::from_millis(r.max_backoff_ms),
                multiplier: r.multiplier,
                max_attempts: r.max_attempts,
            },
            event_capacity: self.events.capacity,
        }
    }

    /// Resolves this node's identity.
    ///
    /// Missing values fall back to a fresh UUID v4 for the id and the host
    /// name for the display name.
    pub fn local_identity(&self) -> DeviceInfo {
        let device_id = self
            .node
            .device_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let device_name = self
            .node
            .device_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(default_device_name);
        DeviceInfo::new(device_id, device_name)
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "synapse".to_string())
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Loads the config from the default location.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads and validates the config at `path`, returning defaults if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and
/// [`ConfigError::Invalid`] if a value is out of range.
pub fn load_config_from(path: &Path) -> Result<EngineConfig, ConfigError> {
    let cfg = match std::fs::read_to_string(path) {
        Ok(content) => toml::from_str::<EngineConfig>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file; using defaults");
            EngineConfig::default()
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Resolves the platform config base directory including the `Synapse`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Synapse"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("synapse"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Synapse")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
