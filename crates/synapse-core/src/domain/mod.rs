//! Domain types shared by both roles.
//!
//! Pure data and rules only: no sockets, no clocks, no async.
//!
//! - **`session`** – [`session::Role`], [`session::SessionStatus`] and
//!   [`session::DeviceInfo`], plus the legal role transitions.

pub mod session;
