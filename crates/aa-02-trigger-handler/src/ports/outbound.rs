//! # Driven Ports (SPI - Outbound)
//!
//! The ledger as the trigger handler sees it: everything the evaluator reads
//! through [`LedgerReader`], plus writes, the trigger queue and a
//! transaction with named savepoints.
//!
//! ## Transaction discipline
//!
//! Every write happens inside `begin`/`commit`. A cascade takes a savepoint
//! before it touches anything and rolls back to it when any invocation in
//! the cascade bounces, so none of its writes survive.

use crate::domain::composer::verify_unit;
use aa_01_formula::domain::{AaDefinitionRecord, AaResponse, ChainContext, StoredValue};
use aa_01_formula::ports::outbound::LedgerReader;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{Address, Amount, Asset, Input, LedgerError, Message, Mci, SpendableOutput, Unit, UnitHash};
use std::collections::BTreeMap;
use thiserror::Error;

/// A stable trigger waiting to be handled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingTrigger {
    /// MCI at which the trigger became stable.
    pub mci: Mci,
    /// Triggering unit.
    pub unit: UnitHash,
    /// Triggered AA.
    pub aa_address: Address,
}

/// Why a composed unit was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitValidationError {
    /// The unit breaks a ledger rule; the AA bounces.
    #[error("{0}")]
    Invalid(String),

    /// Storage failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Transactional ledger used by the trigger handler.
#[async_trait]
pub trait AaLedger: LedgerReader {
    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------

    /// Opens a transaction.
    async fn begin(&self) -> Result<(), LedgerError>;

    /// Commits the open transaction.
    async fn commit(&self) -> Result<(), LedgerError>;

    /// Discards the open transaction.
    async fn rollback(&self) -> Result<(), LedgerError>;

    /// Marks a point the transaction can return to.
    async fn savepoint(&self, name: &str) -> Result<(), LedgerError>;

    /// Undoes everything after `name`; the savepoint stays.
    async fn rollback_to(&self, name: &str) -> Result<(), LedgerError>;

    /// Forgets `name` and every later savepoint, keeping their writes.
    async fn release(&self, name: &str) -> Result<(), LedgerError>;

    // -------------------------------------------------------------------------
    // Trigger queue
    // -------------------------------------------------------------------------

    /// Triggers ready to run, in processing order.
    async fn read_pending_triggers(&self) -> Result<Vec<PendingTrigger>, LedgerError>;

    /// Removes a handled trigger from the queue.
    async fn remove_pending_trigger(&self, trigger: &PendingTrigger) -> Result<(), LedgerError>;

    /// Main chain context at `mci`.
    async fn read_chain_context(&self, mci: Mci) -> Result<ChainContext, LedgerError>;

    // -------------------------------------------------------------------------
    // Coins
    // -------------------------------------------------------------------------

    /// Unspent outputs of `address` in `asset`: stable ones up to `max_mci`
    /// and unstable ones created by AAs.
    async fn read_spendable_outputs(
        &self,
        address: &Address,
        asset: &Asset,
        max_mci: Mci,
    ) -> Result<Vec<SpendableOutput>, LedgerError>;

    /// Highest issue serial number used for `asset`.
    async fn read_max_issue_serial(&self, asset: &Asset) -> Result<Option<u64>, LedgerError>;

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Stores a unit, spends its inputs and records its outputs.
    async fn save_unit(&self, unit: &Unit, mci: Option<Mci>) -> Result<(), LedgerError>;

    /// Sets a cached balance.
    async fn write_balance(&self, address: &Address, asset: &Asset, amount: Amount) -> Result<(), LedgerError>;

    /// Sets a storage size counter.
    async fn write_storage_size(&self, address: &Address, size: i64) -> Result<(), LedgerError>;

    /// Sets a state variable; `None` deletes it.
    async fn write_state_var(
        &self,
        address: &Address,
        name: &str,
        value: Option<&StoredValue>,
    ) -> Result<(), LedgerError>;

    /// Appends a response record.
    async fn save_response(&self, response: &AaResponse) -> Result<(), LedgerError>;

    /// Stores an accepted AA definition.
    async fn save_aa_definition(&self, record: &AaDefinitionRecord) -> Result<(), LedgerError>;

    // -------------------------------------------------------------------------
    // Scans
    // -------------------------------------------------------------------------

    /// Every AA address.
    async fn read_aa_addresses(&self) -> Result<Vec<Address>, LedgerError>;

    /// Cached balances of `address`.
    async fn read_balances(&self, address: &Address) -> Result<BTreeMap<Asset, Amount>, LedgerError>;

    /// Sum of the unspent outputs of `address`, per asset.
    async fn read_unspent_totals(&self, address: &Address) -> Result<BTreeMap<Asset, Amount>, LedgerError>;

    /// Every stored state variable of `address`.
    async fn read_state_vars(&self, address: &Address) -> Result<Vec<(String, StoredValue)>, LedgerError>;

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Full ledger validation of a composed response unit.
    ///
    /// The default checks structure, hash and that every payment balances
    /// against the outputs it spends.
    async fn validate_unit(&self, unit: &Unit) -> Result<(), UnitValidationError> {
        let mut amounts = BTreeMap::new();
        for (_, payment) in unit.payments() {
            for input in &payment.inputs {
                let Input::Transfer { unit: source, message_index, output_index } = input else {
                    continue;
                };
                let stored = self
                    .read_unit(source)
                    .await?
                    .ok_or_else(|| UnitValidationError::Invalid(format!("input unit {source} not found")))?;
                let amount = match stored.unit.messages.get(*message_index as usize) {
                    Some(Message::Payment(p)) => p.outputs.get(*output_index as usize).map(|o| o.amount),
                    _ => None,
                }
                .ok_or_else(|| {
                    UnitValidationError::Invalid(format!("output {source}:{message_index}:{output_index} not found"))
                })?;
                amounts.insert((source.clone(), *message_index, *output_index), amount);
            }
        }
        verify_unit(unit, &amounts).map_err(UnitValidationError::Invalid)
    }
}
