//! # synapse-core
//!
//! Shared library for Synapse containing the session wire protocol and the
//! domain types both roles agree on.
//!
//! This crate is used by the session engine and by anything that needs to
//! speak the protocol (test peers, tools). It has zero dependencies on
//! network sockets or async runtimes.
//!
//! # Architecture overview
//!
//! A Synapse node runs in one of two roles.  As a **server** it listens for
//! incoming devices and keeps a registry of every device that completed the
//! handshake.  As a **client** it holds exactly one outbound connection to a
//! server and keeps reconnecting until told to stop.
//!
//! - **`protocol`** – How bytes travel over the network.  Messages are encoded
//!   into a compact binary format (24-byte header + payload) and decoded back
//!   into typed Rust values on the other end.
//!
//! - **`domain`** – Role, status and device identity types, plus the rules for
//!   which role transitions are legal.

pub mod domain;
pub mod protocol;

pub use domain::session::{DeviceId, DeviceInfo, Role, SessionStatus};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::SessionMessage;
