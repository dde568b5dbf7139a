//! Sponsored ("two-party") settlement of agent account operations.
//!
//! Build → pre-sign (agent key) → co-sign (gas payer) → submit → check status.
//! A failure before submission leaves no trace on the ledger; a half-signed
//! transaction is simply dropped.

pub mod collector;
pub mod cosign;
pub mod protocol;

pub use collector::FeeCollector;
pub use cosign::{CoSigner, HttpSponsor};
pub use protocol::{
    AccountAction, PresignedTransaction, SettlementProtocol, SettlementReceipt,
};

use std::fmt;
use thiserror::Error;

/// The two distinguished roles of a settlement transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    GasPayer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sender => write!(f, "sender"),
            Self::GasPayer => write!(f, "gas payer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    /// No signature was obtained; nothing was submitted.
    #[error("{role} signature unavailable: {reason}")]
    SignatureUnavailable { role: Role, reason: String },

    #[error("{role} signature is from {actual}, expected {expected}")]
    SignerMismatch {
        role: Role,
        expected: String,
        actual: String,
    },

    /// Rejected client-side before any funds could move.
    #[error("insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: u64, available: u64 },

    #[error("invalid settlement request: {0}")]
    InvalidRequest(String),

    /// The referenced object version was already consumed. Rebuild and retry.
    #[error("stale object version: {0}")]
    Conflict(String),

    /// The ledger executed the transaction and reported a failure status.
    #[error("transaction {digest} failed: {error}")]
    ExecutionFailed { digest: String, error: String },

    #[error("ledger request failed: {0:#}")]
    Ledger(anyhow::Error),
}

impl SettlementError {
    /// Safe to retry from scratch: nothing moved and the cause is transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SignatureUnavailable { .. } | Self::Conflict(_) | Self::Ledger(_)
        )
    }
}
