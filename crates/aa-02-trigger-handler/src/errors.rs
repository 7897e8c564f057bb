//! # Error Types
//!
//! A bounce is not an error here: it is recorded as a bounced `AaResponse`.
//! Everything in this module stops trigger processing.

use crate::domain::CompositionError;
use crate::ports::outbound::UnitValidationError;
use aa_01_formula::errors::{EvalError, ValidationError};
use shared_types::{Address, Amount, Asset, LedgerError, UnitHash};
use thiserror::Error;

/// Failures that halt trigger processing.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// Storage failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// The queued address has no AA definition.
    #[error("{0} is not an AA")]
    NotAnAa(Address),

    /// The queued trigger unit is unknown or has no author.
    #[error("trigger unit {0} not found")]
    TriggerNotFound(UnitHash),

    /// A stored definition cannot be run.
    #[error("invalid definition of {address}: {reason}")]
    InvalidDefinition { address: Address, reason: String },

    /// A definition was rejected by the validator.
    #[error("definition rejected: {0}")]
    Rejected(#[from] ValidationError),

    /// Formula source could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// No parser is configured.
    #[error("no formula parser configured")]
    NoParser,

    /// Cached balance disagrees with unspent outputs.
    #[error("balance mismatch for {address} in {asset}: cached {cached}, outputs {outputs}")]
    BalanceMismatch { address: Address, asset: Asset, cached: Amount, outputs: Amount },

    /// Storage size counter disagrees with the stored variables.
    #[error("storage size mismatch for {address}: counter {counter}, variables {actual}")]
    StorageSizeMismatch { address: Address, counter: i64, actual: i64 },

    /// Any other broken consistency rule.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl HandlerError {
    /// Whether this is a consistency failure found by a scan.
    #[must_use]
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            HandlerError::BalanceMismatch { .. }
                | HandlerError::StorageSizeMismatch { .. }
                | HandlerError::InvariantViolation(_)
        )
    }
}

/// How an evaluation failure is handled.
pub(crate) enum Failure {
    /// Deterministic; the invocation bounces with this reason.
    Bounce(String),
    /// Host failure; processing stops.
    Fatal(HandlerError),
}

impl From<EvalError> for Failure {
    fn from(e: EvalError) -> Self {
        match e {
            EvalError::Ledger(l) => Failure::Fatal(HandlerError::Ledger(l)),
            other => Failure::Bounce(other.to_string()),
        }
    }
}

impl From<HandlerError> for Failure {
    fn from(e: HandlerError) -> Self {
        Failure::Fatal(e)
    }
}

impl From<LedgerError> for Failure {
    fn from(e: LedgerError) -> Self {
        Failure::Fatal(HandlerError::Ledger(e))
    }
}

impl From<CompositionError> for Failure {
    fn from(e: CompositionError) -> Self {
        match e {
            CompositionError::Ledger(l) => Failure::Fatal(HandlerError::Ledger(l)),
            other => Failure::Bounce(other.to_string()),
        }
    }
}

impl From<UnitValidationError> for Failure {
    fn from(e: UnitValidationError) -> Self {
        match e {
            UnitValidationError::Invalid(reason) => Failure::Bounce(reason),
            UnitValidationError::Ledger(l) => Failure::Fatal(HandlerError::Ledger(l)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_ledger_errors_are_fatal() {
        assert!(matches!(Failure::from(EvalError::Bounce("x".into())), Failure::Bounce(m) if m == "x"));
        assert!(matches!(Failure::from(EvalError::failed("div")), Failure::Bounce(_)));
        assert!(matches!(
            Failure::from(EvalError::Ledger(LedgerError::NoTransaction)),
            Failure::Fatal(HandlerError::Ledger(_))
        ));
    }

    #[test]
    fn test_composition_failures_bounce() {
        let e = CompositionError::NotEnoughFunds { asset: Asset::base(), needed: 10, available: 3 };
        assert!(matches!(Failure::from(e), Failure::Bounce(m) if m.contains("not enough funds")));
        assert!(matches!(
            Failure::from(UnitValidationError::Ledger(LedgerError::NoTransaction)),
            Failure::Fatal(_)
        ));
    }

    #[test]
    fn test_invariant_classification() {
        let e = HandlerError::StorageSizeMismatch { address: Address::default(), counter: 1, actual: 2 };
        assert!(e.is_invariant_violation());
        assert!(!HandlerError::NoParser.is_invariant_violation());
    }
}
