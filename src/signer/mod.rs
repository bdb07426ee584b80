//! Signer adapter
//!
//! The connection never builds or signs transactions itself. It asks an
//! injected [`Signer`] for a transaction covering a requested amount and
//! applies the typed outcome to its ledger.

pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::Amount;

pub use mock::{MockOutcome, MockSigner};

/// A transaction the signer has confirmed as created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHandle {
    /// Signer-assigned transaction identifier
    pub id: String,
    /// Amount covered by the transaction, never more than requested
    pub amount: Amount,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl TransactionHandle {
    pub fn new<S: Into<String>>(id: S, amount: Amount) -> Self {
        Self {
            id: id.into(),
            amount,
            created_at: Utc::now(),
        }
    }
}

/// Failure reported by a signer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// Temporary failure, the same request may succeed later
    #[error("retriable signer failure: {0}")]
    Retriable(String),
    /// Permanent failure, e.g. insufficient funds or a revoked credential
    #[error("fatal signer failure: {0}")]
    Fatal(String),
}

impl SignerError {
    /// Create a new retriable error
    pub fn retriable<S: Into<String>>(msg: S) -> Self {
        Self::Retriable(msg.into())
    }

    /// Create a new fatal error
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable(_))
    }
}

/// External value-transfer signer
#[async_trait]
pub trait Signer: Send + Sync {
    /// Create a signed transaction for `amount` base units
    async fn create_transaction(
        &self,
        amount: Amount,
    ) -> std::result::Result<TransactionHandle, SignerError>;
}
