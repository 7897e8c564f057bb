//! # AA-02 Trigger Handler - Autonomous Agent Responses
//!
//! **Subsystem ID:** 2
//! **Status:** Production-Ready
//!
//! ## Purpose
//!
//! Takes stable triggers off the queue and runs them through the formula
//! engine. Each run composes at most one response unit per invocation,
//! updates balances, state variables and storage sizes, and cascades to
//! every AA the response unit pays. Bounces roll the whole cascade back and
//! refund the trigger minus the bounce fees.
//!
//! ## Domain Invariants
//!
//! | Invariant | Enforcement Location |
//! |-----------|---------------------|
//! | One transaction per primary trigger | `service.rs` - `process_trigger()` |
//! | Cascade is all or nothing | `handler.rs` - `handle_primary()` |
//! | Response count bounded per trigger | `handler.rs` - `invoke()` |
//! | Byte balance covers storage size | `handler.rs` - `run()` |
//! | Coin selection is deterministic | `domain/coin_selection.rs` - `select_coins()` |
//! | Response units pass full validation | `domain/composer.rs` - `verify_unit()` |
//! | Cached balances match unspent outputs | `service.rs` - `check_balances()` |
//! | Storage counters match stored variables | `service.rs` - `check_storage_sizes()` |
//!
//! ## Outbound Dependencies
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | `AaLedger` | Transactions, savepoints, queue, outputs, writes |
//! | `LedgerReader` | Everything formulas read |
//! | `FormulaParser` | Optional source text parsing |
//!
//! ## Usage Example
//!
//! ```ignore
//! use aa_02_trigger_handler::prelude::*;
//!
//! let service = AaService::new(Arc::new(ledger), AaConfig::from_env());
//! service.define_aa(record).await?;
//! for event in service.handle_aa_triggers().await? {
//!     broadcast(event.units);
//! }
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
pub mod domain;
pub mod errors;
pub mod events;
pub mod handler;
pub mod ports;
pub mod service;

// =============================================================================
// PRELUDE
// =============================================================================

/// Convenient re-exports for common usage.
pub mod prelude {
    // Domain
    pub use crate::domain::{compose_unit, select_coins, CoinSelection, ComposedUnit, CompositionError, Issuance};

    // Handler and service
    pub use crate::handler::{CascadeResult, TriggerHandler};
    pub use crate::service::{AaService, ServiceStats};

    // Ports
    pub use crate::ports::inbound::AaEngineApi;
    pub use crate::ports::outbound::{AaLedger, PendingTrigger, UnitValidationError};

    // Adapters
    pub use crate::adapters::InMemoryAaLedger;

    // Errors and events
    pub use crate::errors::HandlerError;
    pub use crate::events::AaResponsesEvent;
}

// =============================================================================
// CRATE INFO
// =============================================================================

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subsystem ID.
pub const SUBSYSTEM_ID: u8 = 2;

/// Subsystem name.
pub const SUBSYSTEM_NAME: &str = "AA Trigger Handler";
