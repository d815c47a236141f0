//! synapse-session library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the `synapse` binary in `main.rs` share the same module tree.

pub mod application;
pub mod infrastructure;

pub use application::events::{EventBus, EventSubscriber, SessionEvent};
pub use application::session_controller::{SessionController, SessionError, SessionSettings};
