//! # Execution Entities
//!
//! Trigger, cascade state and response records shared by the evaluator and
//! the trigger handler.

use super::value::Value;
use serde::{Deserialize, Serialize};
use shared_types::{Address, Amount, Asset, Mci, Unit, UnitHash};
use std::collections::BTreeMap;

// =============================================================================
// TRIGGER
// =============================================================================

/// What caused an AA to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Sender of the triggering unit.
    pub address: Address,
    /// Sender of the primary trigger of the cascade.
    pub initial_address: Address,
    /// Triggering unit.
    pub unit: UnitHash,
    /// Primary triggering unit of the cascade.
    pub initial_unit: UnitHash,
    /// Amounts received by the AA, per asset.
    pub outputs: BTreeMap<Asset, Amount>,
    /// Payload of the first data message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Trigger {
    /// Primary trigger built from a unit that pays `aa`.
    #[must_use]
    pub fn from_unit(unit: &Unit, aa: &Address) -> Option<Self> {
        let author = unit.author_address()?.clone();
        Some(Self {
            address: author.clone(),
            initial_address: author,
            unit: unit.unit.clone(),
            initial_unit: unit.unit.clone(),
            outputs: unit.outputs_to(aa),
            data: unit.data_payload().cloned(),
        })
    }

    /// Secondary trigger: `unit`, authored by an AA, pays `recipient`.
    #[must_use]
    pub fn secondary(parent: &Trigger, unit: &Unit, recipient: &Address) -> Option<Self> {
        let author = unit.author_address()?.clone();
        Some(Self {
            address: author,
            initial_address: parent.initial_address.clone(),
            unit: unit.unit.clone(),
            initial_unit: parent.initial_unit.clone(),
            outputs: unit.outputs_to(recipient),
            data: unit.data_payload().cloned(),
        })
    }

    /// Amount received in `asset`.
    #[must_use]
    pub fn amount(&self, asset: &Asset) -> Amount {
        self.outputs.get(asset).copied().unwrap_or(0)
    }
}

/// Main chain position a cascade executes at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainContext {
    /// MCI of the trigger.
    pub mci: Mci,
    /// Timestamp of the last stable ball.
    pub timestamp: u64,
    /// Main chain unit at `mci`.
    pub mc_unit: UnitHash,
    /// Last stable ball unit.
    pub last_ball_unit: UnitHash,
}

// =============================================================================
// CASCADE STATE
// =============================================================================

/// Cached state variable.
#[derive(Debug, Clone, PartialEq)]
pub struct StateVarEntry {
    /// Current value; `false` when unset.
    pub value: Value,
    /// Value at the start of the current invocation.
    pub old_value: Value,
    /// Value at the start of the cascade.
    pub original_old_value: Value,
    /// Whether the cascade wrote it.
    pub updated: bool,
}

impl StateVarEntry {
    /// Entry for a freshly loaded value.
    #[must_use]
    pub fn loaded(value: Value) -> Self {
        Self {
            old_value: value.clone(),
            original_old_value: value.clone(),
            value,
            updated: false,
        }
    }
}

/// Everything a cascade reads and writes before it is persisted.
///
/// Cloning the state is how the handler takes a rollback point.
#[derive(Debug, Clone)]
pub struct ValidationState {
    /// Chain position.
    pub context: ChainContext,
    /// Balances of AAs touched by the cascade.
    pub balances: BTreeMap<Address, BTreeMap<Asset, Amount>>,
    /// State variables read or written by the cascade.
    pub state_vars: BTreeMap<Address, BTreeMap<String, StateVarEntry>>,
    /// Storage sizes of AAs touched by the cascade.
    pub storage_sizes: BTreeMap<Address, i64>,
    /// Response units emitted so far.
    pub number_of_responses: usize,
    /// Response units composed so far, oldest first.
    pub response_units: Vec<Unit>,
    /// Responses recorded so far, oldest first.
    pub responses: Vec<AaResponse>,
}

impl ValidationState {
    /// Empty state at `context`.
    #[must_use]
    pub fn new(context: ChainContext) -> Self {
        Self {
            context,
            balances: BTreeMap::new(),
            state_vars: BTreeMap::new(),
            storage_sizes: BTreeMap::new(),
            number_of_responses: 0,
            response_units: Vec::new(),
            responses: Vec::new(),
        }
    }

    /// A response unit composed earlier in this cascade.
    #[must_use]
    pub fn response_unit(&self, hash: &UnitHash) -> Option<&Unit> {
        self.response_units.iter().find(|u| &u.unit == hash)
    }

    /// Rebases `old_value` of every cached variable of `address` to its current value.
    pub fn begin_invocation(&mut self, address: &Address) {
        if let Some(vars) = self.state_vars.get_mut(address) {
            for entry in vars.values_mut() {
                entry.old_value = entry.value.clone();
            }
        }
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Summary of a state variable changed by a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedStateVar {
    /// New value; absent when deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Value before the cascade; absent when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
    /// Numeric change, when both sides are numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<serde_json::Value>,
}

/// Body of a response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseBody {
    /// Bounce reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Informational note (e.g. no messages were produced).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    /// Response variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub response_vars: BTreeMap<String, serde_json::Value>,
    /// Lines written by `log`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    /// State variables changed by the whole cascade; primary response only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_state_vars: Option<BTreeMap<Address, BTreeMap<String, UpdatedStateVar>>>,
}

/// Outcome of one AA invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AaResponse {
    /// MCI of the cascade.
    pub mci: Mci,
    /// Sender of the trigger.
    pub trigger_address: Address,
    /// Triggering unit.
    pub trigger_unit: UnitHash,
    /// Primary triggering unit.
    pub trigger_initial_unit: UnitHash,
    /// The AA.
    pub aa_address: Address,
    /// Whether the invocation bounced.
    pub bounced: bool,
    /// Emitted unit, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_unit: Option<UnitHash>,
    /// Response details.
    pub response: ResponseBody,
    /// Post-cascade balances of the AA.
    pub balances: BTreeMap<Asset, Amount>,
}
