//! Error types for uplink connections.

use thiserror::Error;

/// Errors raised while establishing or driving an uplink socket.
#[derive(Debug, Error)]
pub enum UplinkError {
    /// The endpoint URL could not be turned into a connect request.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The transport-level connect did not complete inside the deadline.
    #[error("connect timeout")]
    ConnectTimeout,

    /// The transport-level connect failed outright.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The socket errored after it was established.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

impl UplinkError {
    /// Whether this failure should penalize the endpoint's health score.
    ///
    /// Everything here is the upstream's fault; the distinction exists so
    /// future variants that are not (e.g. local shutdown) have a place to
    /// opt out.
    #[must_use]
    pub fn should_penalize(&self) -> bool {
        match self {
            UplinkError::InvalidEndpoint(_) => false,
            UplinkError::ConnectTimeout |
            UplinkError::ConnectionFailed(_) |
            UplinkError::Transport(_) => true,
        }
    }
}
