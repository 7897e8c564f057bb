//! # Error Types
//!
//! Validation errors are raised once, when a definition or formula is
//! accepted. Evaluation errors are raised per trigger; every one of them
//! except a ledger failure turns into a bounce.

use crate::domain::decimal::DecimalError;
use shared_types::LedgerError;
use thiserror::Error;

/// Static validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Complexity budget exceeded.
    #[error("complexity exceeded: {complexity} > {max}")]
    ComplexityExceeded { complexity: u32, max: u32 },

    /// Operation budget exceeded.
    #[error("number of ops exceeded: {count} > {max}")]
    TooManyOps { count: u32, max: u32 },

    /// A feature is used before its activation MCI.
    #[error("{0} is not activated yet")]
    NotActivated(String),

    /// Read of a local variable that is never assigned on this path.
    #[error("uninitialized local var {0}")]
    Uninitialized(String),

    /// Second assignment to a local variable.
    #[error("local var {0} already assigned")]
    Reassignment(String),

    /// Mutation of a frozen local variable.
    #[error("local var {0} is frozen")]
    Frozen(String),

    /// Call of something that is not a function.
    #[error("{0} is not a function")]
    NotAFunction(String),

    /// Function used as a value or value used as a function.
    #[error("{0} is a function")]
    IsAFunction(String),

    /// Wrong number of arguments.
    #[error("{func} expects {min}..={max} arguments, got {got}")]
    WrongArity { func: String, got: usize, min: usize, max: usize },

    /// A statement list contains an expression.
    #[error("not a statement: {0}")]
    NotAStatement(String),

    /// A construct is not allowed in this kind of formula.
    #[error("{0} not allowed here")]
    Forbidden(String),

    /// Malformed data feed or attestation search.
    #[error("bad search parameters: {0}")]
    BadSearchParams(String),

    /// A remote getter does not exist.
    #[error("no getter {getter} on AA {aa}")]
    UnknownGetter { aa: String, getter: String },

    /// Anything else that makes the formula unacceptable.
    #[error("{0}")]
    Invalid(String),
}

/// Runtime evaluation failures.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// Explicit `bounce` or failed `require`.
    #[error("{0}")]
    Bounce(String),

    /// The formula hit an undefined operation.
    #[error("{0}")]
    Failed(String),

    /// A callee definition failed validation.
    #[error("remote definition invalid: {0}")]
    Remote(#[from] ValidationError),

    /// Storage failed; not a property of the formula.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl EvalError {
    /// Shorthand for a runtime failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        EvalError::Failed(msg.into())
    }

    /// Whether the error must abort processing instead of bouncing.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvalError::Ledger(_))
    }
}

impl From<DecimalError> for EvalError {
    fn from(e: DecimalError) -> Self {
        EvalError::Failed(e.to_string())
    }
}
