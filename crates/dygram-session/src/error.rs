//! Error types for session store operations.

use thiserror::Error;

/// Result type for session store operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no execution found with id '{0}'")]
    NotFound(String),

    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("machine hash mismatch for '{id}': machine definition changed since this execution was saved (pass --force to resume anyway)")]
    HashMismatch { id: String },

    #[error("malformed session artifact: {0}")]
    Invalid(String),

    #[error(transparent)]
    Engine(#[from] dygram_core::error::EngineError),
}
