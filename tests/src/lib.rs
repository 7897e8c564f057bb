//! # Autonomous Agents Test Suite
//!
//! Unified test crate exercising the formula engine and the trigger handler
//! together through the public service API.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # Units, definitions and a ready service
//! └── integration/
//!     ├── flows.rs      # Payments, bounces, cascades, dry runs
//!     └── invariants.rs # Balance and storage scans, determinism
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! # All tests
//! cargo test -p aa-tests
//!
//! # By category
//! cargo test -p aa-tests integration::flows
//! cargo test -p aa-tests integration::invariants
//!
//! # Benchmarks
//! cargo bench -p aa-tests
//! ```

#![allow(dead_code)]

pub mod fixtures;
pub mod integration;
