//! # Adapters Module
//!
//! - `memory_ledger`: ledger snapshot in maps, implementing `LedgerReader`

pub mod memory_ledger;

pub use memory_ledger::{InMemoryLedgerReader, LedgerData};
