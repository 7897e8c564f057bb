//! # Event Schema
//!
//! Payloads published after a trigger batch is processed. Each handled
//! trigger produces one [`AaResponsesEvent`] carrying a fresh
//! `correlation_id` that also tags every log line of its cascade.

use aa_01_formula::domain::AaResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{Address, Mci, Unit, UnitHash};
use uuid::Uuid;

/// Result of one primary trigger and its cascade.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AaResponsesEvent {
    /// Correlation ID shared with the cascade's tracing span.
    pub correlation_id: Uuid,
    /// MCI of the trigger.
    pub mci: Mci,
    /// Triggering unit.
    pub trigger_unit: UnitHash,
    /// Primary AA.
    pub aa_address: Address,
    /// Responses in invocation order.
    pub responses: Vec<AaResponse>,
    /// Response units to broadcast.
    pub units: Vec<Unit>,
    /// When processing finished.
    pub processed_at: DateTime<Utc>,
}

impl AaResponsesEvent {
    /// Whether the primary invocation bounced.
    #[must_use]
    pub fn bounced(&self) -> bool {
        self.responses.first().is_some_and(|r| r.bounced)
    }
}
