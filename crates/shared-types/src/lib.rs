//! # Shared Types Crate
//!
//! Ledger entities exchanged between the AA subsystems.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: units, messages and outputs are defined here
//!   once and consumed by both the formula engine and the trigger handler.
//! - **Canonical Form**: every hash in the ledger is computed over the
//!   canonical JSON produced by [`hashing::canonical_json`].

pub mod entities;
pub mod errors;
pub mod hashing;

pub use entities::*;
pub use errors::*;
pub use hashing::*;
