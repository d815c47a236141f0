//! Network infrastructure for both roles.
//!
//! # Sub-modules
//!
//! - **`framing`** – Buffers bytes from a socket into whole protocol frames
//!   and writes numbered frames back out.
//!
//! - **`handshake`** – `Hello`/`Welcome` exchange with version and identity
//!   checks, bounded by a timeout.
//!
//! - **`keepalive`** – Ping/Pong liveness loop that runs on every established
//!   connection until the peer leaves, goes silent, or the session stops.
//!
//! - **`acceptor`** – Server role: listens, handshakes each peer, and keeps
//!   the device registry in step with the open connections.
//!
//! - **`initiator`** – Client role: one outbound connection, re-established
//!   with exponential backoff whenever it fails or drops.
//!
//! - **`backoff`** – The retry schedule used by the initiator.
//!
//! - **`address`** – `host:port` parsing for bind and target addresses.

pub mod acceptor;
pub mod address;
pub mod backoff;
pub mod framing;
pub mod handshake;
pub mod initiator;
pub mod keepalive;
