//! # Driving Ports (API - Inbound)
//!
//! What the consensus layer and wallets call.

use crate::errors::HandlerError;
use crate::events::AaResponsesEvent;
use aa_01_formula::domain::{AaDefinitionRecord, AaResponse};
use aa_01_formula::validator::DefinitionInfo;
use async_trait::async_trait;
use shared_types::{Address, Mci, Unit};

/// Public API of the trigger handler.
#[async_trait]
pub trait AaEngineApi: Send + Sync {
    /// Processes every queued trigger, oldest first, each in its own
    /// transaction.
    ///
    /// Stops at the first trigger that fails. Events of the triggers
    /// committed before it are still returned and the failed trigger stays
    /// queued, so the error surfaces on the next call.
    ///
    /// # Errors
    ///
    /// Returns the error of the first queued trigger when it fails.
    async fn handle_aa_triggers(&self) -> Result<Vec<AaResponsesEvent>, HandlerError>;

    /// Runs `trigger_unit` against `aa` as if it became stable at `mci`,
    /// then discards every effect.
    async fn estimate_primary_aa_trigger(
        &self,
        trigger_unit: Unit,
        aa: &Address,
        mci: Mci,
    ) -> Result<Vec<AaResponse>, HandlerError>;

    /// Validates and stores a new AA definition.
    async fn define_aa(&self, record: AaDefinitionRecord) -> Result<DefinitionInfo, HandlerError>;

    /// Compares every cached balance with the unspent outputs behind it.
    async fn check_balances(&self) -> Result<(), HandlerError>;

    /// Compares every storage size counter with the stored variables.
    async fn check_storage_sizes(&self) -> Result<(), HandlerError>;
}
