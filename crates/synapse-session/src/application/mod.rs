//! Application layer of the session engine.
//!
//! Owns the state every connection task shares and the single place where
//! the role changes.  Sockets live in `infrastructure`; this layer only
//! decides what those sockets mean for the rest of the process.
//!
//! # Sub-modules
//!
//! - **`device_registry`** – The live set of devices connected to the server,
//!   keyed by device id, each tied to the connection that registered it.
//!
//! - **`events`** – The broadcast bus that carries `status`, `log`,
//!   `device-connected` and `device-disconnected` to every subscriber, plus
//!   the status cell that publishes on every change.
//!
//! - **`session_controller`** – `start_server`, `start_client`, `stop` and
//!   `get_status`: the role state machine.

pub mod device_registry;
pub mod events;
pub mod session_controller;
