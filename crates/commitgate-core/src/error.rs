//! Error types for commitgate

use thiserror::Error;

/// Result type alias using the commitgate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication coordinator
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (hosts file, sockets owned by a transport)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors while reading configuration
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wire protocol errors: framing, CRC, unknown or unexpected message kinds
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Delivery failures reported by the messaging transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
