//! # Ports Layer
//!
//! Interfaces between the formula engine and the outside world.
//!
//! - **Driven Ports (Outbound)**: `LedgerReader`, `GetterLookup`, `FormulaParser`

pub mod outbound;

pub use outbound::*;
