//! # AA-01 Formula Engine - Autonomous Agent Formulas
//!
//! **Subsystem ID:** 1
//! **Status:** Production-Ready
//!
//! ## Purpose
//!
//! Validates Autonomous Agent definitions once, when they are posted, and
//! evaluates their formulas every time an AA is triggered. Formulas arrive
//! as syntax trees; parsing source text is delegated to a `FormulaParser`
//! and memoized by [`cache::FormulaCache`].
//!
//! ## Domain Invariants
//!
//! | Invariant | Enforcement Location |
//! |-----------|---------------------|
//! | Complexity and op budgets | `validator/mod.rs` - `Walker::complex()`, `Walker::op()` |
//! | Locals assigned once, frozen after capture | `validator/locals.rs` - `Locals::assign()` |
//! | Features gated by activation MCI | `validator/mod.rs` - `Walker::gate()` |
//! | 15 significant digits, no NaN or infinity | `domain/decimal.rs` - `Decimal` |
//! | Ledger reads bounded by the cascade MCI | `evaluator/lookups.rs` |
//! | Remote getters priced the same at definition and call time | `evaluator/getters.rs` - `getter_costs()` |
//! | State vars written only by the state message | `evaluator/mod.rs` - `assign_state_var()` |
//!
//! ## Outbound Dependencies
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | `LedgerReader` | Balances, state vars, definitions, units, data feeds, attestations, assets |
//! | `GetterLookup` | Static cost of other AAs' getters |
//! | `FormulaParser` | Source text to syntax tree |
//!
//! ## Usage Example
//!
//! ```ignore
//! use aa_01_formula::prelude::*;
//!
//! let info = validate_aa_definition(&definition, mci, &config, &NoGetters)?;
//! let mut ev = Evaluator::new(&ledger, &config, &mut state, &mut invocation, EvalMode::default());
//! let substitution = ev.substitute_messages(&definition.messages).await?;
//! ```

// Crate-level lints
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

// =============================================================================
// MODULES
// =============================================================================

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod evaluator;
pub mod ports;
pub mod validator;

// =============================================================================
// PRELUDE
// =============================================================================

/// Convenient re-exports for common usage.
pub mod prelude {
    // Domain
    pub use crate::domain::{
        AaDefinition, AaDefinitionKind, AaDefinitionRecord, AaResponse, ChainContext, Decimal, Expr,
        ResponseBody, StateVarEntry, StoredValue, Template, Trigger, UpdatedStateVar, ValidationState, Value,
    };

    // Validation and evaluation
    pub use crate::evaluator::{EvalMode, Evaluator, Invocation, Scope, Substitution};
    pub use crate::validator::{
        validate_aa_definition, validate_formula, validate_getters, Complexity, DefinitionInfo,
        ValidatorOptions,
    };

    // Ports
    pub use crate::ports::outbound::{FormulaParser, GetterLookup, LedgerReader, NoGetters};

    // Adapters
    pub use crate::adapters::{InMemoryLedgerReader, LedgerData};

    // Configuration, cache, errors
    pub use crate::cache::FormulaCache;
    pub use crate::config::{ActivationHeights, AaConfig};
    pub use crate::errors::{EvalError, ValidationError};
}

// =============================================================================
// CRATE INFO
// =============================================================================

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subsystem ID.
pub const SUBSYSTEM_ID: u8 = 1;

/// Subsystem name.
pub const SUBSYSTEM_NAME: &str = "AA Formula Engine";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_exports() {
        use prelude::*;
        let _ = AaConfig::default();
        let _ = Value::from(Decimal::ONE);
        assert_eq!(SUBSYSTEM_ID, 1);
    }
}
