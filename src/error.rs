//! Error types for the moneystream engine

use thiserror::Error;

use crate::signer::SignerError;

/// Result type alias for moneystream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Main error type for connections, streams and the send loop
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Stream {0} is closed")]
    StreamClosed(u32),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Amount overflow: {0}")]
    AmountOverflow(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StreamError {
    /// Create a new connection closed error
    pub fn connection_closed<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionClosed(msg.into())
    }

    /// Create a new link error
    pub fn link<S: Into<String>>(msg: S) -> Self {
        Self::Link(msg.into())
    }

    /// Create a new ledger error
    pub fn ledger<S: Into<String>>(msg: S) -> Self {
        Self::Ledger(msg.into())
    }

    /// Create a new amount overflow error
    pub fn overflow<S: Into<String>>(msg: S) -> Self {
        Self::AmountOverflow(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Whether the send loop may try the same operation again
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Signer(e) => e.is_retriable(),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(StreamError::timeout(50).is_retriable());
        assert!(StreamError::from(SignerError::retriable("busy")).is_retriable());
        assert!(!StreamError::from(SignerError::fatal("insufficient funds")).is_retriable());
        assert!(!StreamError::link("down").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = StreamError::timeout(250);
        assert_eq!(err.to_string(), "Timeout error: operation timed out after 250ms");

        let err = StreamError::StreamClosed(3);
        assert_eq!(err.to_string(), "Stream 3 is closed");
    }
}
