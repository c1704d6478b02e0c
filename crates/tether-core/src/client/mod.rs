//! Downstream client connection handling.
//!
//! The [`manager`] accepts downstream sockets, enforces the per-IP ceiling
//! and owns the client roster; each accepted socket gets a [`session`] task
//! that drives the client-facing state: control envelope, filter dispatch,
//! bounded buffering, heartbeats and the main + auxiliary uplinks.

pub mod manager;
pub mod session;

pub use manager::ConnectionManager;
pub use session::{ClientHandle, SessionContext};

/// Signal from the connection manager to a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientControl {
    /// Abandon the current main uplink endpoint and pick a new one.
    Migrate,
}
