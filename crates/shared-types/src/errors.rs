//! # Error Types
//!
//! Errors raised by ledger storage and shared encoding helpers.

use thiserror::Error;

/// Errors that can occur while reading or writing ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// A referenced unit is not known.
    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    /// A savepoint was released or rolled back without being taken.
    #[error("Unknown savepoint: {0}")]
    UnknownSavepoint(String),

    /// A write was attempted outside a transaction.
    #[error("No active transaction")]
    NoTransaction,

    /// A transaction was started while another one is open.
    #[error("Transaction already open")]
    TransactionOpen,

    /// Stored data could not be decoded.
    #[error("Corrupted record: {0}")]
    Corrupted(String),

    /// Encoding to JSON failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend failure.
    #[error("Database error: {0}")]
    Database(String),
}
