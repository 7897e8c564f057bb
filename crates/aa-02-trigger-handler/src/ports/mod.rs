//! # Ports Layer
//!
//! - **Inbound (Driving)**: the API consumers call to process triggers
//! - **Outbound (Driven)**: the transactional ledger the handler writes to

pub mod inbound;
pub mod outbound;
