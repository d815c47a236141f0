//! Integration tests for the session controller over real TCP sockets.
//!
//! # Purpose
//!
//! These tests drive [`SessionController`] through its public API the way a
//! frontend does, with real loopback connections on ephemeral ports.  They
//! verify:
//!
//! - The server registry: devices appear in connection order, disappear when
//!   their connection closes, and a reconnect under the same id replaces the
//!   old entry.
//! - The client: retries an unreachable server without ever reporting
//!   `connected`, and reaches a real server end to end.
//! - Control: `stop` is bounded even with silent peers, overlapping starts
//!   are rejected, and stopping an idle node is a no-op.
//!
//! # Fake devices
//!
//! Server-side tests connect "devices" that speak just enough protocol to
//! complete the handshake and then sit idle.  The liveness timeout in
//! [`idle_peer_settings`] is long enough that the server never drops them
//! for silence during a test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use synapse_core::protocol::DisconnectReason;
use synapse_core::{DeviceInfo, Role, SessionMessage, SessionStatus};
use synapse_session::application::events::{EventSubscriber, SessionEvent};
use synapse_session::application::session_controller::{
    SessionController, SessionError, SessionSettings,
};
use synapse_session::infrastructure::network::backoff::ReconnectConfig;
use synapse_session::infrastructure::network::framing::{FrameReader, FrameWriter};
use synapse_session::infrastructure::network::handshake::initiate_handshake;
use synapse_session::infrastructure::network::keepalive::KeepaliveConfig;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const EVENT_WAIT: Duration = Duration::from_secs(3);

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Short timeouts for everything except peer silence.
fn idle_peer_settings() -> SessionSettings {
    SessionSettings {
        handshake_timeout: Duration::from_secs(1),
        keepalive: KeepaliveConfig {
            ping_interval: Duration::from_secs(1),
            liveness_timeout: Duration::from_secs(10),
        },
        connect_timeout: Duration::from_millis(500),
        shutdown_deadline: Duration::from_secs(1),
        reconnect: ReconnectConfig {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: None,
        },
        event_capacity: 256,
    }
}

/// Both ends answer pings, so the keepalive can be tight.
fn live_peer_settings() -> SessionSettings {
    SessionSettings {
        keepalive: KeepaliveConfig {
            ping_interval: Duration::from_millis(100),
            liveness_timeout: Duration::from_secs(1),
        },
        ..idle_peer_settings()
    }
}

fn controller(id: &str, settings: SessionSettings) -> Arc<SessionController> {
    Arc::new(SessionController::new(
        DeviceInfo::new(id, format!("Node {id}")),
        settings,
    ))
}

async fn start_loopback_server(ctl: &SessionController) -> SocketAddr {
    ctl.start_server("127.0.0.1:0").await.expect("start server");
    ctl.listen_addr().expect("listening address")
}

/// Waits for the first event matching `pred`, skipping everything before it.
async fn wait_for<F>(events: &mut EventSubscriber, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collects events up to and including the first one matching `last`.
async fn collect_until<F>(events: &mut EventSubscriber, mut last: F) -> Vec<SessionEvent>
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            let done = last(&event);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out collecting events");
    seen
}

fn ids(devices: &[DeviceInfo]) -> Vec<&str> {
    devices.iter().map(|d| d.device_id.as_str()).collect()
}

/// A peer that completes the handshake and then stays quiet.
struct FakeDevice {
    reader: FrameReader<OwnedReadHalf>,
    _writer: FrameWriter<OwnedWriteHalf>,
    server: DeviceInfo,
}

impl FakeDevice {
    async fn join(addr: SocketAddr, id: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (r, w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        let mut writer = FrameWriter::new(w);
        let server = initiate_handshake(
            &mut reader,
            &mut writer,
            &DeviceInfo::new(id, format!("Device {id}")),
            Duration::from_secs(2),
        )
        .await
        .expect("handshake");
        Self {
            reader,
            _writer: writer,
            server,
        }
    }

    /// Next frame from the server that is not a ping.
    async fn next_non_ping(&mut self) -> Option<SessionMessage> {
        tokio::time::timeout(EVENT_WAIT, async {
            loop {
                match self.reader.next_message().await.expect("read frame") {
                    Some(SessionMessage::Ping(_)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .expect("timed out reading from server")
    }
}

fn connected_event(id: &'static str) -> impl FnMut(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::DeviceConnected(info) if info.device_id == id)
}

fn disconnected_event(id: &'static str) -> impl FnMut(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::DeviceDisconnected(d) if d == id)
}

// ── Server registry ───────────────────────────────────────────────────────────

/// Two devices register in order; when the first one hangs up only the
/// second remains.
#[tokio::test]
async fn test_registry_tracks_connects_and_disconnects_in_order() {
    // Arrange
    let server = controller("srv", idle_peer_settings());
    let mut events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    // Act: connect a, then b.
    let device_a = FakeDevice::join(addr, "a").await;
    wait_for(&mut events, connected_event("a")).await;
    let _device_b = FakeDevice::join(addr, "b").await;
    wait_for(&mut events, connected_event("b")).await;

    // Assert
    assert_eq!(ids(&server.devices()), ["a", "b"]);
    assert_eq!(device_a.server.device_id, "srv");
    assert_eq!(server.get_status(), SessionStatus::new(Role::Server, true));

    // Act: a hangs up.
    drop(device_a);
    wait_for(&mut events, disconnected_event("a")).await;

    // Assert: b is still there and the server is still connected.
    assert_eq!(ids(&server.devices()), ["b"]);
    assert!(server.get_status().connected);

    server.stop().await.unwrap();
}

/// The first device moves the server to `connected`; the last one leaving
/// moves it back.
#[tokio::test]
async fn test_server_connected_follows_registry_size() {
    let server = controller("srv", idle_peer_settings());
    let mut events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    let device = FakeDevice::join(addr, "a").await;
    let before_connect = collect_until(&mut events, connected_event("a")).await;

    // status(connected) precedes device-connected.
    assert!(before_connect.contains(&SessionEvent::Status(SessionStatus::new(Role::Server, true))));

    drop(device);
    let after_disconnect = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::Status(s) if s.role == Role::Server && !s.connected)
    })
    .await;

    assert!(after_disconnect.contains(&SessionEvent::DeviceDisconnected("a".into())));
    assert!(server.devices().is_empty());

    server.stop().await.unwrap();
}

/// A device reconnecting under the same id replaces its old entry: one
/// disconnect and one connect, registry size unchanged, old socket told why.
#[tokio::test]
async fn test_reconnect_with_same_id_replaces_entry() {
    // Arrange
    let server = controller("srv", idle_peer_settings());
    let mut events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    let mut first = FakeDevice::join(addr, "a").await;
    wait_for(&mut events, connected_event("a")).await;
    let _other = FakeDevice::join(addr, "b").await;
    wait_for(&mut events, connected_event("b")).await;

    // Act
    let _second = FakeDevice::join(addr, "a").await;
    let seen = collect_until(&mut events, connected_event("a")).await;

    // Assert: exactly one disconnect for "a", and it came first.
    let disconnects = seen
        .iter()
        .filter(|e| matches!(e, SessionEvent::DeviceDisconnected(id) if id == "a"))
        .count();
    assert_eq!(disconnects, 1);
    assert!(matches!(seen.first(), Some(SessionEvent::DeviceDisconnected(id)) if id == "a"));

    // The replacement moved to the end; the size did not change.
    assert_eq!(ids(&server.devices()), ["b", "a"]);

    // The evicted connection receives a goodbye.
    assert_eq!(
        first.next_non_ping().await,
        Some(SessionMessage::Bye {
            reason: DisconnectReason::Replaced
        })
    );

    server.stop().await.unwrap();
    assert!(server.devices().is_empty());
}

/// A connection that never says Hello is logged and never registered.
#[tokio::test]
async fn test_silent_connection_is_rejected_after_handshake_timeout() {
    let server = controller("srv", idle_peer_settings());
    let mut events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    let _silent = TcpStream::connect(addr).await.unwrap();

    let rejected = wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Log(line) if line.starts_with("Rejected connection from"))
    })
    .await;

    assert!(matches!(rejected, SessionEvent::Log(line) if line.contains("timed out")));
    assert!(server.devices().is_empty());
    assert!(!server.get_status().connected);

    server.stop().await.unwrap();
}

// ── Client role ───────────────────────────────────────────────────────────────

/// A client pointed at a closed port keeps retrying and never reports
/// `connected`.
#[tokio::test]
async fn test_unreachable_client_retries_without_connecting() {
    // Arrange: find a port nobody listens on.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let client = controller("cli", idle_peer_settings());
    let mut events = client.subscribe();

    // Act
    client
        .start_client(&format!("127.0.0.1:{port}"))
        .await
        .expect("address is valid");

    let mut failures = 0;
    let seen = collect_until(&mut events, |e| {
        if matches!(e, SessionEvent::Log(line) if line.contains("failed")) {
            failures += 1;
        }
        failures >= 3
    })
    .await;

    // Assert
    assert!(seen
        .iter()
        .all(|e| !matches!(e, SessionEvent::Status(s) if s.connected)));
    assert_eq!(client.get_status(), SessionStatus::new(Role::Client, false));
    assert!(client.remote_peer().is_none());

    client.stop().await.unwrap();
    assert_eq!(client.get_status(), SessionStatus::IDLE);
}

/// Two controllers on loopback: the client connects, sees the server's
/// identity, and its clean stop removes it from the server's registry.
#[tokio::test]
async fn test_client_and_server_connect_end_to_end() {
    // Arrange
    let server = controller("srv", live_peer_settings());
    let mut server_events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    let client = controller("cli", live_peer_settings());
    let mut client_events = client.subscribe();

    // Act
    client.start_client(&addr.to_string()).await.unwrap();
    wait_for(&mut client_events, |e| {
        matches!(e, SessionEvent::Status(s) if s.connected)
    })
    .await;
    wait_for(&mut server_events, connected_event("cli")).await;

    // Assert
    assert_eq!(client.remote_peer().map(|p| p.device_id), Some("srv".to_string()));
    assert_eq!(ids(&server.devices()), ["cli"]);

    // Keepalive holds the link across several ping intervals.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(client.get_status().connected);
    assert_eq!(server.devices().len(), 1);

    // Act: the client leaves.
    client.stop().await.unwrap();
    wait_for(&mut server_events, disconnected_event("cli")).await;

    // Assert
    assert!(server.devices().is_empty());
    assert!(client.remote_peer().is_none());

    server.stop().await.unwrap();
}

/// When the server goes away the client drops to `connected = false` and
/// logs the loss.
#[tokio::test]
async fn test_client_reports_lost_connection_when_server_stops() {
    let server = controller("srv", live_peer_settings());
    let addr = start_loopback_server(&server).await;
    let client = controller("cli", live_peer_settings());
    let mut events = client.subscribe();

    client.start_client(&addr.to_string()).await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Status(s) if s.connected)).await;

    server.stop().await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, SessionEvent::Log(line) if line.starts_with("Connection to") && line.contains("lost"))
    })
    .await;
    assert_eq!(client.get_status(), SessionStatus::new(Role::Client, false));

    client.stop().await.unwrap();
}

/// Two clients sharing one device id keep evicting each other; each
/// eviction must cost the loser a backoff wait, not an instant reconnect.
#[tokio::test]
async fn test_clients_sharing_an_id_reconnect_under_backoff() {
    // Arrange
    let server = controller("srv", live_peer_settings());
    let mut events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    let settings = SessionSettings {
        reconnect: ReconnectConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            multiplier: 2.0,
            max_attempts: None,
        },
        ..live_peer_settings()
    };
    let first = controller("dup", settings.clone());
    let second = controller("dup", settings);

    // Act
    first.start_client(&addr.to_string()).await.unwrap();
    second.start_client(&addr.to_string()).await.unwrap();

    let mut registrations = 0;
    let window = tokio::time::sleep(Duration::from_millis(1500));
    tokio::pin!(window);
    loop {
        tokio::select! {
            _ = &mut window => break,
            Some(event) = events.recv() => {
                if matches!(&event, SessionEvent::DeviceConnected(info) if info.device_id == "dup") {
                    registrations += 1;
                }
            }
        }
    }

    // Assert: backoff 0.1, 0.2, 0.4, 0.4 ... per client over 1.5 s.
    assert!(registrations >= 2, "both clients should register at least once");
    assert!(registrations <= 16, "{registrations} registrations in 1.5s");
    assert!(server.devices().len() <= 1);

    first.stop().await.unwrap();
    second.stop().await.unwrap();
    server.stop().await.unwrap();
}

// ── Control operations ────────────────────────────────────────────────────────

/// `stop` returns within the deadline even with a peer that never finished
/// the handshake and one that never reads.
#[tokio::test]
async fn test_stop_is_bounded_with_unresponsive_peers() {
    // Arrange
    let settings = idle_peer_settings();
    let deadline = settings.shutdown_deadline;
    let server = controller("srv", settings);
    let mut events = server.subscribe();
    let addr = start_loopback_server(&server).await;

    let _no_hello = TcpStream::connect(addr).await.unwrap();
    let mut device = FakeDevice::join(addr, "a").await;
    wait_for(&mut events, connected_event("a")).await;

    // Act
    let started = Instant::now();
    server.stop().await.unwrap();
    let elapsed = started.elapsed();

    // Assert
    assert!(elapsed <= deadline + Duration::from_millis(250), "stop took {elapsed:?}");
    assert_eq!(server.get_status(), SessionStatus::IDLE);
    assert!(server.devices().is_empty());

    let tail = collect_until(&mut events, |e| *e == SessionEvent::Status(SessionStatus::IDLE)).await;
    assert!(tail.contains(&SessionEvent::DeviceDisconnected("a".into())));
    assert!(tail.contains(&SessionEvent::Log("Stopped".into())));

    assert_eq!(
        device.next_non_ping().await,
        Some(SessionMessage::Bye {
            reason: DisconnectReason::ServerShutdown
        })
    );
}

/// Two overlapping start requests: exactly one wins.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_start_server_only_one_succeeds() {
    let server = controller("srv", idle_peer_settings());

    let a = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start_server("127.0.0.1:0").await }
    });
    let b = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start_server("127.0.0.1:0").await }
    });
    let results = [a.await.unwrap(), b.await.unwrap()];

    let ok = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(ok, 1, "results: {results:?}");
    assert!(results.iter().any(|r| matches!(
        r,
        Err(SessionError::Busy) | Err(SessionError::InvalidState { current: Role::Server })
    )));
    assert_eq!(server.get_status().role, Role::Server);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_client_while_serving_is_invalid_state() {
    let server = controller("srv", idle_peer_settings());
    start_loopback_server(&server).await;

    let err = server.start_client("127.0.0.1:24800").await.unwrap_err();

    assert!(matches!(err, SessionError::InvalidState { current: Role::Server }));
    server.stop().await.unwrap();
}

/// A port already in use leaves the node idle and silent.
#[tokio::test]
async fn test_bind_conflict_keeps_node_idle() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap();
    let server = controller("srv", idle_peer_settings());
    let mut events = server.subscribe();

    let err = server.start_server(&addr.to_string()).await.unwrap_err();

    assert!(matches!(err, SessionError::BindError { .. }));
    assert_eq!(server.get_status(), SessionStatus::IDLE);
    assert!(events.try_recv().is_none());
}

#[tokio::test]
async fn test_stop_while_idle_emits_nothing() {
    let node = controller("n", idle_peer_settings());
    let mut events = node.subscribe();

    node.stop().await.unwrap();
    node.stop().await.unwrap();

    assert!(events.try_recv().is_none());
    assert_eq!(node.get_status(), SessionStatus::IDLE);
}

/// After a stop the same controller can take the other role.
#[tokio::test]
async fn test_role_switch_passes_through_idle() {
    let node = controller("n", idle_peer_settings());
    let mut events = node.subscribe();

    start_loopback_server(&node).await;
    node.stop().await.unwrap();
    node.start_client("127.0.0.1:1").await.unwrap();

    let roles: Vec<Role> = collect_until(&mut events, |e| {
        matches!(e, SessionEvent::Status(s) if s.role == Role::Client)
    })
    .await
    .into_iter()
    .filter_map(|e| match e {
        SessionEvent::Status(s) => Some(s.role),
        _ => None,
    })
    .collect();

    assert_eq!(roles, [Role::Server, Role::Idle, Role::Client]);
    node.stop().await.unwrap();
}
