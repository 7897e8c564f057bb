//! # Driven Ports (SPI - Outbound)
//!
//! What the evaluator needs from the ledger, plus the two synchronous
//! collaborators of the validator.
//!
//! Every ledger read is bounded by the MCI passed in the query or the
//! cascade's own context; adapters must never return data that became
//! stable after it.

use crate::domain::ast::Expr;
use crate::domain::template::AaDefinitionRecord;
use crate::domain::value::StoredValue;
use crate::validator::Complexity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_types::{Address, Amount, Asset, AssetInfo, LedgerError, Mci, Unit, UnitHash};
use std::collections::BTreeMap;

// =============================================================================
// RECORDS
// =============================================================================

/// A unit together with its stability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUnit {
    /// The unit.
    pub unit: Unit,
    /// MCI once stable.
    pub mci: Option<Mci>,
}

/// Data feed search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFeedQuery {
    /// Oracles whose postings count.
    pub oracles: Vec<Address>,
    /// Feed name.
    pub feed_name: String,
    /// Lowest MCI considered.
    pub min_mci: Mci,
    /// Highest MCI considered.
    pub max_mci: Mci,
}

/// One posted data feed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFeedRecord {
    /// Posting oracle.
    pub oracle: Address,
    /// Feed name.
    pub feed_name: String,
    /// Posted value: a string or a number.
    pub value: serde_json::Value,
    /// Posting unit.
    pub unit: UnitHash,
    /// MCI of the posting unit.
    pub mci: Mci,
}

/// Attestation search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationQuery {
    /// Attestors whose attestations count.
    pub attestors: Vec<Address>,
    /// Attested address.
    pub address: Address,
    /// Highest MCI considered.
    pub max_mci: Mci,
}

/// One attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Attestor.
    pub attestor: Address,
    /// Attested address.
    pub address: Address,
    /// Attesting unit.
    pub unit: UnitHash,
    /// MCI of the attesting unit.
    pub mci: Mci,
    /// Attested fields.
    pub profile: BTreeMap<String, serde_json::Value>,
}

// =============================================================================
// LEDGER ACCESS
// =============================================================================

/// Read access to stable ledger state.
#[async_trait]
pub trait LedgerReader: Send + Sync {
    /// Persisted balance of `address` in `asset` (0 if none).
    async fn read_balance(&self, address: &Address, asset: &Asset) -> Result<Amount, LedgerError>;

    /// Persisted storage size of an AA (0 if none).
    async fn read_storage_size(&self, address: &Address) -> Result<i64, LedgerError>;

    /// Persisted state variable.
    async fn read_state_var(
        &self,
        address: &Address,
        name: &str,
    ) -> Result<Option<StoredValue>, LedgerError>;

    /// AA definition, regardless of MCI; callers compare `mci` themselves.
    async fn read_aa_definition(
        &self,
        address: &Address,
    ) -> Result<Option<AaDefinitionRecord>, LedgerError>;

    /// Definition of a plain address.
    async fn read_definition(
        &self,
        address: &Address,
    ) -> Result<Option<serde_json::Value>, LedgerError>;

    /// A unit with its stability.
    async fn read_unit(&self, unit: &UnitHash) -> Result<Option<StoredUnit>, LedgerError>;

    /// Stable data feed postings matching the query, newest first.
    async fn read_data_feeds(&self, query: &DataFeedQuery) -> Result<Vec<DataFeedRecord>, LedgerError>;

    /// Stable attestations matching the query, newest first.
    async fn read_attestations(
        &self,
        query: &AttestationQuery,
    ) -> Result<Vec<AttestationRecord>, LedgerError>;

    /// Asset properties.
    async fn read_asset(&self, asset: &Asset) -> Result<Option<AssetInfo>, LedgerError>;
}

// =============================================================================
// VALIDATION COLLABORATORS
// =============================================================================

/// Static complexity of other AAs' getters, for validating remote calls
/// whose target is a literal address.
pub trait GetterLookup: Send + Sync {
    /// Complexity of `getter` exported by `aa`, if it exists.
    fn getter_complexity(&self, aa: &Address, getter: &str) -> Option<Complexity>;
}

/// Lookup that knows no getters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGetters;

impl GetterLookup for NoGetters {
    fn getter_complexity(&self, _aa: &Address, _getter: &str) -> Option<Complexity> {
        None
    }
}

impl GetterLookup for BTreeMap<(Address, String), Complexity> {
    fn getter_complexity(&self, aa: &Address, getter: &str) -> Option<Complexity> {
        self.get(&(aa.clone(), getter.to_string())).copied()
    }
}

/// Turns formula source text into a syntax tree.
pub trait FormulaParser: Send + Sync {
    /// Parses `source`.
    ///
    /// # Errors
    ///
    /// Returns a human-readable parse error.
    fn parse(&self, source: &str) -> Result<Expr, String>;
}
