//! Error types for consensus

use thiserror::Error;

/// Result type for consensus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Consensus errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Envelope does not belong to the local round
    #[error("Protocol mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch {
        /// Local round id
        expected: String,
        /// Received round id
        actual: String,
    },

    /// Peer unreachable or answered garbage
    #[error("Network error with {peer}: {reason}")]
    Network {
        /// Peer connection string
        peer: String,
        /// What went wrong
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Rejected input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Actor mailbox or reply channel closed
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

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
        match self {
            Error::Configuration(_) => true,
            Error::Ledger(inner) => inner.is_fatal(),
            _ => false,
        }
    }

    /// Network error for `peer`
    pub fn network(peer: impl Into<String>, reason: impl ToString) -> Self {
        Error::Network {
            peer: peer.into(),
            reason: reason.to_string(),
        }
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
