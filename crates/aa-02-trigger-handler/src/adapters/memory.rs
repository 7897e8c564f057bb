//! # In-Memory AA Ledger
//!
//! Transactional ledger held in memory. Transactions and savepoints are
//! whole-store snapshots, which makes rollback exact. Used by tests and as
//! the reference behaviour for persistent adapters.

use crate::ports::outbound::{AaLedger, PendingTrigger};
use aa_01_formula::adapters::LedgerData;
use aa_01_formula::domain::{AaDefinitionRecord, AaResponse, ChainContext, StoredValue};
use aa_01_formula::ports::outbound::{
    AttestationQuery, AttestationRecord, DataFeedQuery, DataFeedRecord, LedgerReader, StoredUnit,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::{
    compute_unit_hash, Address, Amount, Asset, AssetInfo, Author, Input, LedgerError, Message, Mci, Output,
    Payment, SpendableOutput, Unit, UnitHash,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

type OutputRef = (UnitHash, u32, u32);

#[derive(Debug, Clone)]
struct OutputRecord {
    address: Address,
    asset: Asset,
    amount: Amount,
    mci: Option<Mci>,
    from_aa: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryStore {
    data: LedgerData,
    unspent: BTreeMap<OutputRef, OutputRecord>,
    issue_serials: BTreeMap<Asset, u64>,
    queue: BTreeSet<PendingTrigger>,
    contexts: BTreeMap<Mci, ChainContext>,
    responses: Vec<AaResponse>,
}

impl MemoryStore {
    fn apply_unit(&mut self, unit: &Unit, mci: Option<Mci>) {
        let from_aa = unit.author_address().is_some_and(|a| self.data.aa_definitions.contains_key(a));
        for (message_index, payment) in unit.payments() {
            for input in &payment.inputs {
                match input {
                    Input::Transfer { unit, message_index, output_index } => {
                        self.unspent.remove(&(unit.clone(), *message_index, *output_index));
                    }
                    Input::Issue { serial_number, .. } => {
                        let max = self.issue_serials.entry(payment.asset.clone()).or_insert(0);
                        *max = (*max).max(*serial_number);
                    }
                }
            }
            for (output_index, output) in payment.outputs.iter().enumerate() {
                let key = (unit.unit.clone(), message_index as u32, output_index as u32);
                let record = OutputRecord {
                    address: output.address.clone(),
                    asset: payment.asset.clone(),
                    amount: output.amount,
                    mci,
                    from_aa,
                };
                self.unspent.insert(key, record);
            }
        }
        self.data.add_unit(unit.clone(), mci);
    }
}

#[derive(Debug)]
struct Transaction {
    start: MemoryStore,
    savepoints: Vec<(String, MemoryStore)>,
}

/// In-memory [`AaLedger`].
#[derive(Debug, Default)]
pub struct InMemoryAaLedger {
    store: RwLock<MemoryStore>,
    tx: Mutex<Option<Transaction>>,
}

impl InMemoryAaLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger seeded with `data`.
    #[must_use]
    pub fn with_data(data: LedgerData) -> Self {
        let store = MemoryStore { data, ..MemoryStore::default() };
        Self { store: RwLock::new(store), tx: Mutex::new(None) }
    }

    fn ensure_tx(&self) -> Result<(), LedgerError> {
        if self.tx.lock().is_some() {
            Ok(())
        } else {
            Err(LedgerError::NoTransaction)
        }
    }

    fn write(&self, f: impl FnOnce(&mut MemoryStore)) -> Result<(), LedgerError> {
        self.ensure_tx()?;
        f(&mut self.store.write());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seeding, outside transactions
    // -------------------------------------------------------------------------

    /// Mutates the readable ledger state directly.
    pub fn update(&self, f: impl FnOnce(&mut LedgerData)) {
        f(&mut self.store.write().data);
    }

    /// Stores a unit with its outputs.
    pub fn seed_unit(&self, unit: &Unit, mci: Option<Mci>) {
        self.store.write().apply_unit(unit, mci);
    }

    /// Sets the main chain context of `context.mci`.
    pub fn set_chain_context(&self, context: ChainContext) {
        self.store.write().contexts.insert(context.mci, context);
    }

    /// Queues a trigger.
    pub fn enqueue(&self, trigger: PendingTrigger) {
        self.store.write().queue.insert(trigger);
    }

    /// Stores a stable unit and queues it for every AA it pays.
    pub fn add_trigger_unit(&self, unit: &Unit, mci: Mci) -> Vec<PendingTrigger> {
        let mut store = self.store.write();
        store.apply_unit(unit, Some(mci));
        let triggers: Vec<PendingTrigger> = unit
            .output_addresses()
            .into_iter()
            .filter(|a| store.data.aa_definitions.get(a).is_some_and(|r| r.mci <= mci))
            .map(|aa_address| PendingTrigger { mci, unit: unit.unit.clone(), aa_address })
            .collect();
        store.queue.extend(triggers.iter().cloned());
        triggers
    }

    /// Gives `address` a stable output of `amount` and the matching balance.
    pub fn fund(&self, address: &Address, asset: &Asset, amount: Amount, mci: Mci) {
        let mut unit = Unit {
            unit: UnitHash::default(),
            version: "4.0".into(),
            alt: "1".into(),
            authors: vec![Author::new(Address::new("F".repeat(32)))],
            parent_units: vec![],
            last_ball_unit: None,
            timestamp: mci,
            headers_commission: 0,
            payload_commission: 0,
            messages: vec![Message::Payment(Payment {
                asset: asset.clone(),
                inputs: vec![],
                outputs: vec![Output { address: address.clone(), amount }],
            })],
        };
        let mut store = self.store.write();
        unit.unit = compute_unit_hash(&unit)
            .unwrap_or_else(|_| UnitHash::new(format!("{:064}", store.unspent.len())));
        store.apply_unit(&unit, Some(mci));
        let balance = store.data.balance(address, asset);
        store.data.set_balance(address, asset, balance + amount);
    }

    /// Copy of the readable state.
    #[must_use]
    pub fn snapshot(&self) -> LedgerData {
        self.store.read().data.clone()
    }

    /// Every saved response.
    #[must_use]
    pub fn responses(&self) -> Vec<AaResponse> {
        self.store.read().responses.clone()
    }

    /// Number of queued triggers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.store.read().queue.len()
    }

    /// Whether a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.tx.lock().is_some()
    }
}

#[async_trait]
impl LedgerReader for InMemoryAaLedger {
    async fn read_balance(&self, address: &Address, asset: &Asset) -> Result<Amount, LedgerError> {
        Ok(self.store.read().data.balance(address, asset))
    }

    async fn read_storage_size(&self, address: &Address) -> Result<i64, LedgerError> {
        Ok(self.store.read().data.storage_size(address))
    }

    async fn read_state_var(&self, address: &Address, name: &str) -> Result<Option<StoredValue>, LedgerError> {
        Ok(self.store.read().data.state_var(address, name))
    }

    async fn read_aa_definition(&self, address: &Address) -> Result<Option<AaDefinitionRecord>, LedgerError> {
        Ok(self.store.read().data.aa_definitions.get(address).cloned())
    }

    async fn read_definition(&self, address: &Address) -> Result<Option<serde_json::Value>, LedgerError> {
        Ok(self.store.read().data.definitions.get(address).cloned())
    }

    async fn read_unit(&self, unit: &UnitHash) -> Result<Option<StoredUnit>, LedgerError> {
        Ok(self.store.read().data.units.get(unit).cloned())
    }

    async fn read_data_feeds(&self, query: &DataFeedQuery) -> Result<Vec<DataFeedRecord>, LedgerError> {
        Ok(self.store.read().data.matching_feeds(query))
    }

    async fn read_attestations(&self, query: &AttestationQuery) -> Result<Vec<AttestationRecord>, LedgerError> {
        Ok(self.store.read().data.matching_attestations(query))
    }

    async fn read_asset(&self, asset: &Asset) -> Result<Option<AssetInfo>, LedgerError> {
        Ok(self.store.read().data.assets.get(asset).cloned())
    }
}

#[async_trait]
impl AaLedger for InMemoryAaLedger {
    async fn begin(&self) -> Result<(), LedgerError> {
        let mut tx = self.tx.lock();
        if tx.is_some() {
            return Err(LedgerError::TransactionOpen);
        }
        *tx = Some(Transaction { start: self.store.read().clone(), savepoints: Vec::new() });
        Ok(())
    }

    async fn commit(&self) -> Result<(), LedgerError> {
        self.tx.lock().take().map(|_| ()).ok_or(LedgerError::NoTransaction)
    }

    async fn rollback(&self) -> Result<(), LedgerError> {
        let tx = self.tx.lock().take().ok_or(LedgerError::NoTransaction)?;
        *self.store.write() = tx.start;
        debug!("transaction rolled back");
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> Result<(), LedgerError> {
        let mut tx = self.tx.lock();
        let tx = tx.as_mut().ok_or(LedgerError::NoTransaction)?;
        tx.savepoints.push((name.to_string(), self.store.read().clone()));
        Ok(())
    }

    async fn rollback_to(&self, name: &str) -> Result<(), LedgerError> {
        let mut tx = self.tx.lock();
        let tx = tx.as_mut().ok_or(LedgerError::NoTransaction)?;
        let index = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| LedgerError::UnknownSavepoint(name.to_string()))?;
        tx.savepoints.truncate(index + 1);
        *self.store.write() = tx.savepoints[index].1.clone();
        debug!(savepoint = name, "rolled back to savepoint");
        Ok(())
    }

    async fn release(&self, name: &str) -> Result<(), LedgerError> {
        let mut tx = self.tx.lock();
        let tx = tx.as_mut().ok_or(LedgerError::NoTransaction)?;
        let index = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| LedgerError::UnknownSavepoint(name.to_string()))?;
        tx.savepoints.truncate(index);
        Ok(())
    }

    async fn read_pending_triggers(&self) -> Result<Vec<PendingTrigger>, LedgerError> {
        Ok(self.store.read().queue.iter().cloned().collect())
    }

    async fn remove_pending_trigger(&self, trigger: &PendingTrigger) -> Result<(), LedgerError> {
        self.write(|s| {
            s.queue.remove(trigger);
        })
    }

    async fn read_chain_context(&self, mci: Mci) -> Result<ChainContext, LedgerError> {
        self.store
            .read()
            .contexts
            .get(&mci)
            .cloned()
            .ok_or_else(|| LedgerError::UnitNotFound(format!("main chain unit at mci {mci}")))
    }

    async fn read_spendable_outputs(
        &self,
        address: &Address,
        asset: &Asset,
        max_mci: Mci,
    ) -> Result<Vec<SpendableOutput>, LedgerError> {
        let store = self.store.read();
        Ok(store
            .unspent
            .iter()
            .filter(|(_, o)| &o.address == address && &o.asset == asset)
            .filter(|(_, o)| o.mci.map_or(o.from_aa, |m| m <= max_mci))
            .map(|((unit, message_index, output_index), o)| SpendableOutput {
                unit: unit.clone(),
                message_index: *message_index,
                output_index: *output_index,
                amount: o.amount,
                mci: o.mci,
                from_aa: o.from_aa,
            })
            .collect())
    }

    async fn read_max_issue_serial(&self, asset: &Asset) -> Result<Option<u64>, LedgerError> {
        Ok(self.store.read().issue_serials.get(asset).copied())
    }

    async fn save_unit(&self, unit: &Unit, mci: Option<Mci>) -> Result<(), LedgerError> {
        self.write(|s| s.apply_unit(unit, mci))
    }

    async fn write_balance(&self, address: &Address, asset: &Asset, amount: Amount) -> Result<(), LedgerError> {
        self.write(|s| s.data.set_balance(address, asset, amount))
    }

    async fn write_storage_size(&self, address: &Address, size: i64) -> Result<(), LedgerError> {
        self.write(|s| {
            s.data.storage_sizes.insert(address.clone(), size);
        })
    }

    async fn write_state_var(
        &self,
        address: &Address,
        name: &str,
        value: Option<&StoredValue>,
    ) -> Result<(), LedgerError> {
        self.write(|s| {
            let key = (address.clone(), name.to_string());
            match value {
                Some(v) => {
                    s.data.state_vars.insert(key, v.clone());
                }
                None => {
                    s.data.state_vars.remove(&key);
                }
            }
        })
    }

    async fn save_response(&self, response: &AaResponse) -> Result<(), LedgerError> {
        self.write(|s| s.responses.push(response.clone()))
    }

    async fn save_aa_definition(&self, record: &AaDefinitionRecord) -> Result<(), LedgerError> {
        self.write(|s| s.data.add_aa(record.clone()))
    }

    async fn read_aa_addresses(&self) -> Result<Vec<Address>, LedgerError> {
        Ok(self.store.read().data.aa_definitions.keys().cloned().collect())
    }

    async fn read_balances(&self, address: &Address) -> Result<BTreeMap<Asset, Amount>, LedgerError> {
        Ok(self
            .store
            .read()
            .data
            .balances
            .iter()
            .filter(|((a, _), _)| a == address)
            .map(|((_, asset), amount)| (asset.clone(), *amount))
            .collect())
    }

    async fn read_unspent_totals(&self, address: &Address) -> Result<BTreeMap<Asset, Amount>, LedgerError> {
        let mut totals = BTreeMap::new();
        for o in self.store.read().unspent.values().filter(|o| &o.address == address) {
            *totals.entry(o.asset.clone()).or_insert(0) += o.amount;
        }
        Ok(totals)
    }

    async fn read_state_vars(&self, address: &Address) -> Result<Vec<(String, StoredValue)>, LedgerError> {
        Ok(self
            .store
            .read()
            .data
            .state_vars
            .iter()
            .filter(|((a, _), _)| a == address)
            .map(|((_, name), v)| (name.clone(), v.clone()))
            .collect())
    }
}
