//! Common error types for txqueue.

use thiserror::Error;

/// Top-level error type for txqueue operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport-level failure talking to the remote endpoint.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote endpoint did not answer in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A status change outside the transaction state machine.
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Queue is at capacity and nothing could be evicted.
    #[error("Queue full: {0} live transactions")]
    QueueFull(usize),

    /// The queue service has been shut down.
    #[error("Queue is shut down")]
    Shutdown,

    /// The queue was opened for inspection and cannot be changed.
    #[error("Queue is open read-only")]
    ReadOnly,
}

impl Error {
    /// Transport errors are the only ones worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_) | Error::Io(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
