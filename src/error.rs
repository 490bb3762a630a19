//! Error types for the update engine.

use crate::types::ListenerId;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening or reading an upstream tailing query failed.
    #[error("upstream change source unavailable: {0}")]
    Upstream(String),

    /// The connection is already attached to this customer's stream.
    #[error("listener {0} is already attached")]
    ListenerExists(ListenerId),

    /// A change record missing required fields; dropped, never fatal.
    #[error("malformed change record: {0}")]
    MalformedRecord(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StreamError>;
