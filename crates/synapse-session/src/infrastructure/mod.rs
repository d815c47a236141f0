//! Infrastructure layer of the session engine.
//!
//! Contains the OS-facing adapters: TCP sockets and the wire protocol,
//! configuration files, and the command/event boundary used by a frontend.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `synapse_core`, but MUST NOT be imported by `synapse_core`.

pub mod config;
pub mod network;
pub mod ui_bridge;
