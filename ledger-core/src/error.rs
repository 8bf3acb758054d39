//! Error types for the ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Signature or content of an entity is invalid
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity is bound to a stale block id or previous hash
    #[error("Replay rejected: {0}")]
    Replay(String),

    /// Unrecoverable configuration problem (topology, genesis, keys)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Signing or key handling failed
    #[error("Signature error: {0}")]
    Signature(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the node must stop instead of skipping the current frame
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_))
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
