//! # Adapters Layer
//!
//! - `memory`: transactional in-memory ledger with savepoints and a trigger queue

pub mod memory;

pub use memory::InMemoryAaLedger;
