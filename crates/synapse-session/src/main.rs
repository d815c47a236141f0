//! Synapse headless node — entry point.
//!
//! Runs the session engine without a GUI: pick a role on the command line,
//! watch the engine's events on stdout, press Ctrl+C to stop.
//!
//! # Usage
//!
//! ```text
//! synapse [OPTIONS] server [--bind <ADDR>]
//! synapse [OPTIONS] client --server <ADDR>
//!
//! Options:
//!   --config <PATH>        Config file [default: platform config dir]
//!   --device-name <NAME>   Name shown to peers [default: host name]
//!   --json                 Print events as JSON lines
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable              | Description                         |
//! |-----------------------|-------------------------------------|
//! | `SYNAPSE_CONFIG`      | Config file path                    |
//! | `SYNAPSE_DEVICE_NAME` | Name shown to peers                 |
//! | `SYNAPSE_BIND`        | Server bind address                 |
//! | `SYNAPSE_SERVER`      | Server address for the client role  |
//! | `RUST_LOG`            | `tracing` filter (overrides config) |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use synapse_session::application::events::SessionEvent;
use synapse_session::application::session_controller::SessionController;
use synapse_session::infrastructure::config::{self, EngineConfig};
use synapse_session::infrastructure::ui_bridge::{status_devices, to_bridge_event};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Synapse session engine.
#[derive(Debug, Parser)]
#[command(
    name = "synapse",
    about = "Share a session between machines: serve devices or connect to a server",
    version
)]
struct Cli {
    /// Config file to load instead of the platform default.
    #[arg(long, env = "SYNAPSE_CONFIG")]
    config: Option<PathBuf>,

    /// Name this node announces to its peers.
    #[arg(long, env = "SYNAPSE_DEVICE_NAME")]
    device_name: Option<String>,

    /// Print every event as a JSON line on stdout.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Accept device connections.
    Server {
        /// Address to listen on; empty means `0.0.0.0:24800`.
        #[arg(long, env = "SYNAPSE_BIND")]
        bind: Option<String>,
    },
    /// Connect to a Synapse server and stay connected.
    Client {
        /// `host:port` of the server.
        #[arg(long, env = "SYNAPSE_SERVER")]
        server: String,
    },
}

impl Cli {
    /// Loads the config file and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read, parsed
    /// or validated.
    fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => match config::load_config() {
                Ok(cfg) => cfg,
                Err(config::ConfigError::NoPlatformConfigDir) => EngineConfig::default(),
                Err(e) => return Err(e).context("failed to load config"),
            },
        };
        if let Some(name) = &self.device_name {
            cfg.node.device_name = Some(name.clone());
        }
        Ok(cfg)
    }
}

// ── Event output ──────────────────────────────────────────────────────────────

/// Renders an event for the terminal, or `None` for events `tracing`
/// already prints.
fn describe(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Status(status) if status.role.is_idle() => Some("status: idle".to_string()),
        SessionEvent::Status(status) => Some(format!(
            "status: {} ({})",
            status.role,
            if status.connected { "connected" } else { "not connected" }
        )),
        SessionEvent::Log(_) => None,
        SessionEvent::DeviceConnected(info) => Some(format!("device connected: {info}")),
        SessionEvent::DeviceDisconnected(id) => Some(format!("device disconnected: {id}")),
    }
}

/// Prints one event.
///
/// In JSON mode a `status` line carries the registry as it is when printed,
/// filtered by [`status_devices`] so a status without devices prints none.
fn print_event(controller: &SessionController, event: &SessionEvent, json: bool) {
    if json {
        let devices = match event {
            SessionEvent::Status(status) => status_devices(*status, controller.devices()),
            _ => Vec::new(),
        };
        match serde_json::to_string(&to_bridge_event(event, &devices)) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::error!(error = %e, "failed to encode event"),
        }
    } else if let Some(line) = describe(event) {
        println!("{line}");
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.load_config()?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.node.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let identity = cfg.local_identity();
    info!(device_id = %identity.device_id, device_name = %identity.device_name, "Synapse starting");

    let controller = Arc::new(SessionController::new(identity, cfg.session_settings()));
    let mut events = controller.subscribe();

    match &cli.command {
        Command::Server { bind } => {
            let bind = bind.as_deref().unwrap_or(&cfg.network.bind_address);
            controller
                .start_server(bind)
                .await
                .with_context(|| format!("failed to start server on {bind:?}"))?;
        }
        Command::Client { server } => {
            controller
                .start_client(server)
                .await
                .with_context(|| format!("failed to start client for {server:?}"))?;
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal.context("failed to listen for Ctrl+C")?;
                info!("received Ctrl+C, stopping");
                break;
            }
            Some(event) = events.recv() => print_event(&controller, &event, cli.json),
        }
    }

    controller.stop().await?;
    while let Some(event) = events.try_recv() {
        print_event(&controller, &event, cli.json);
    }

    info!("Synapse stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_core::{DeviceInfo, Role, SessionStatus};

    #[test]
    fn test_cli_server_without_bind_uses_config_default() {
        // Arrange
        let cli = Cli::parse_from(["synapse", "server"]);

        // Assert
        assert!(matches!(cli.command, Command::Server { bind: None }));
        assert!(!cli.json);
    }

    #[test]
    fn test_cli_client_requires_server() {
        let result = Cli::try_parse_from(["synapse", "client"]);
        // SYNAPSE_SERVER may be set in the environment; only assert when it is not.
        if std::env::var_os("SYNAPSE_SERVER").is_none() {
            assert!(result.is_err());
        }
    }

    #[test]
    fn test_cli_global_options_before_subcommand() {
        let cli = Cli::parse_from([
            "synapse",
            "--json",
            "--device-name",
            "Desk",
            "client",
            "--server",
            "10.0.0.5:24800",
        ]);

        assert!(cli.json);
        assert_eq!(cli.device_name.as_deref(), Some("Desk"));
        match cli.command {
            Command::Client { server } => assert_eq!(server, "10.0.0.5:24800"),
            other => panic!("expected client, got {other:?}"),
        }
    }

    #[test]
    fn test_device_name_flag_overrides_config() {
        let cli = Cli::parse_from([
            "synapse",
            "--config",
            "/nonexistent/synapse.toml",
            "--device-name",
            "Desk",
            "server",
        ]);

        let cfg = cli.load_config().expect("missing file yields defaults");

        assert_eq!(cfg.node.device_name.as_deref(), Some("Desk"));
    }

    #[test]
    fn test_describe_hides_log_lines() {
        assert!(describe(&SessionEvent::Log("x".into())).is_none());
        assert_eq!(
            describe(&SessionEvent::Status(SessionStatus::new(Role::Server, true))).as_deref(),
            Some("status: server (connected)")
        );
        assert_eq!(
            describe(&SessionEvent::DeviceConnected(DeviceInfo::new("a", "Alpha"))).as_deref(),
            Some("device connected: Alpha (a)")
        );
    }
}
