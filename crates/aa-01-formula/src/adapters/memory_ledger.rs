//! # In-Memory Ledger
//!
//! Ledger snapshot held in ordinary maps. Used by tests, by dry runs, and
//! as the storage model of the trigger handler's in-memory adapter.

use crate::domain::template::AaDefinitionRecord;
use crate::domain::value::{StoredValue, Value};
use crate::ports::outbound::{
    AttestationQuery, AttestationRecord, DataFeedQuery, DataFeedRecord, LedgerReader, StoredUnit,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_types::{Address, Amount, Asset, AssetInfo, LedgerError, Mci, Message, Unit, UnitHash};
use std::collections::BTreeMap;

/// Readable ledger state.
#[derive(Debug, Clone, Default)]
pub struct LedgerData {
    /// AA balances per asset.
    pub balances: BTreeMap<(Address, Asset), Amount>,
    /// AA storage sizes.
    pub storage_sizes: BTreeMap<Address, i64>,
    /// Persisted state variables.
    pub state_vars: BTreeMap<(Address, String), StoredValue>,
    /// AA definitions.
    pub aa_definitions: BTreeMap<Address, AaDefinitionRecord>,
    /// Plain address definitions.
    pub definitions: BTreeMap<Address, serde_json::Value>,
    /// Known units.
    pub units: BTreeMap<UnitHash, StoredUnit>,
    /// Data feed postings, oldest first.
    pub data_feeds: Vec<DataFeedRecord>,
    /// Attestations, oldest first.
    pub attestations: Vec<AttestationRecord>,
    /// Assets.
    pub assets: BTreeMap<Asset, AssetInfo>,
}

impl LedgerData {
    /// Sets an AA balance.
    pub fn set_balance(&mut self, address: &Address, asset: &Asset, amount: Amount) {
        self.balances.insert((address.clone(), asset.clone()), amount);
    }

    /// Persists a state variable; `false` deletes it.
    pub fn set_state_var(&mut self, address: &Address, name: &str, value: &Value) {
        let key = (address.clone(), name.to_string());
        match value.to_stored() {
            Some(stored) => {
                self.state_vars.insert(key, stored);
            }
            None => {
                self.state_vars.remove(&key);
            }
        }
    }

    /// Registers an AA definition.
    pub fn add_aa(&mut self, record: AaDefinitionRecord) {
        self.aa_definitions.insert(record.address.clone(), record);
    }

    /// Stores a unit and indexes its data feeds and attestations when stable.
    pub fn add_unit(&mut self, unit: Unit, mci: Option<Mci>) {
        if let (Some(mci), Some(author)) = (mci, unit.author_address()) {
            for message in &unit.messages {
                match message {
                    Message::DataFeed(feeds) => {
                        for (feed_name, value) in feeds {
                            self.data_feeds.push(DataFeedRecord {
                                oracle: author.clone(),
                                feed_name: feed_name.clone(),
                                value: value.clone(),
                                unit: unit.unit.clone(),
                                mci,
                            });
                        }
                    }
                    Message::Attestation { address, profile } => {
                        self.attestations.push(AttestationRecord {
                            attestor: author.clone(),
                            address: address.clone(),
                            unit: unit.unit.clone(),
                            mci,
                            profile: profile.clone(),
                        });
                    }
                    _ => {}
                }
            }
        }
        self.units.insert(unit.unit.clone(), StoredUnit { unit, mci });
    }

    /// Postings matching `query`, newest first.
    #[must_use]
    pub fn matching_feeds(&self, query: &DataFeedQuery) -> Vec<DataFeedRecord> {
        self.data_feeds
            .iter()
            .rev()
            .filter(|r| {
                query.oracles.contains(&r.oracle)
                    && r.feed_name == query.feed_name
                    && (query.min_mci..=query.max_mci).contains(&r.mci)
            })
            .cloned()
            .collect()
    }

    /// Attestations matching `query`, newest first.
    #[must_use]
    pub fn matching_attestations(&self, query: &AttestationQuery) -> Vec<AttestationRecord> {
        self.attestations
            .iter()
            .rev()
            .filter(|r| query.attestors.contains(&r.attestor) && r.address == query.address && r.mci <= query.max_mci)
            .cloned()
            .collect()
    }

    /// Balance of `address` in `asset`.
    #[must_use]
    pub fn balance(&self, address: &Address, asset: &Asset) -> Amount {
        self.balances.get(&(address.clone(), asset.clone())).copied().unwrap_or(0)
    }

    /// Storage size of `address`.
    #[must_use]
    pub fn storage_size(&self, address: &Address) -> i64 {
        self.storage_sizes.get(address).copied().unwrap_or(0)
    }

    /// Persisted state variable.
    #[must_use]
    pub fn state_var(&self, address: &Address, name: &str) -> Option<StoredValue> {
        self.state_vars.get(&(address.clone(), name.to_string())).cloned()
    }
}

/// Read-only ledger over [`LedgerData`].
#[derive(Debug, Default)]
pub struct InMemoryLedgerReader {
    data: RwLock<LedgerData>,
}

impl InMemoryLedgerReader {
    /// Reader over `data`.
    #[must_use]
    pub fn new(data: LedgerData) -> Self {
        Self { data: RwLock::new(data) }
    }

    /// Mutates the snapshot.
    pub fn update(&self, f: impl FnOnce(&mut LedgerData)) {
        f(&mut self.data.write());
    }
}

#[async_trait]
impl LedgerReader for InMemoryLedgerReader {
    async fn read_balance(&self, address: &Address, asset: &Asset) -> Result<Amount, LedgerError> {
        Ok(self.data.read().balance(address, asset))
    }

    async fn read_storage_size(&self, address: &Address) -> Result<i64, LedgerError> {
        Ok(self.data.read().storage_size(address))
    }

    async fn read_state_var(&self, address: &Address, name: &str) -> Result<Option<StoredValue>, LedgerError> {
        Ok(self.data.read().state_var(address, name))
    }

    async fn read_aa_definition(&self, address: &Address) -> Result<Option<AaDefinitionRecord>, LedgerError> {
        Ok(self.data.read().aa_definitions.get(address).cloned())
    }

    async fn read_definition(&self, address: &Address) -> Result<Option<serde_json::Value>, LedgerError> {
        Ok(self.data.read().definitions.get(address).cloned())
    }

    async fn read_unit(&self, unit: &UnitHash) -> Result<Option<StoredUnit>, LedgerError> {
        Ok(self.data.read().units.get(unit).cloned())
    }

    async fn read_data_feeds(&self, query: &DataFeedQuery) -> Result<Vec<DataFeedRecord>, LedgerError> {
        Ok(self.data.read().matching_feeds(query))
    }

    async fn read_attestations(&self, query: &AttestationQuery) -> Result<Vec<AttestationRecord>, LedgerError> {
        Ok(self.data.read().matching_attestations(query))
    }

    async fn read_asset(&self, asset: &Asset) -> Result<Option<AssetInfo>, LedgerError> {
        Ok(self.data.read().assets.get(asset).cloned())
    }
}
