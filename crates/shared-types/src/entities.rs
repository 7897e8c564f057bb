//! # Ledger Entities
//!
//! The subset of the DAG ledger model that Autonomous Agents read and write.
//!
//! ## Clusters
//!
//! - **Identity**: `Address`, `UnitHash`, `Asset`
//! - **Units**: `Unit`, `Author`, `Message`
//! - **Payments**: `Payment`, `Input`, `Output`
//! - **Assets**: `AssetDefinition`, `AssetInfo`

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Amount of an asset, in its smallest indivisible units.
pub type Amount = i64;

/// Main chain index.
pub type Mci = u64;

/// Largest amount a single output or balance may hold.
pub const MAX_CAP: Amount = 9_000_000_000_000_000;

/// Length of a textual address.
pub const ADDRESS_LENGTH: usize = 32;

/// Length of a textual unit hash.
pub const UNIT_HASH_LENGTH: usize = 64;

// =============================================================================
// CLUSTER A: IDENTITY
// =============================================================================

/// A ledger address: 32 uppercase alphanumeric characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Wraps a string without checking it.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Parses and checks an address.
    #[must_use]
    pub fn parse(address: &str) -> Option<Self> {
        is_valid_address(address).then(|| Self(address.to_string()))
    }

    /// The textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the textual form is well formed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_valid_address(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks the textual address format.
#[must_use]
pub fn is_valid_address(s: &str) -> bool {
    s.len() == ADDRESS_LENGTH
        && s.bytes().all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// Hash identifying a unit: 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UnitHash(String);

impl UnitHash {
    /// Wraps a string without checking it.
    #[must_use]
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// The textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the textual form is well formed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_valid_unit_hash(&self.0)
    }
}

impl fmt::Display for UnitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Checks the textual unit hash format.
#[must_use]
pub fn is_valid_unit_hash(s: &str) -> bool {
    s.len() == UNIT_HASH_LENGTH && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// An asset identifier. The native currency is `"base"`; every other asset
/// is named by the hash of the unit that defined it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Asset(String);

impl Asset {
    /// Textual name of the native currency.
    pub const BASE: &'static str = "base";

    /// The native currency.
    #[must_use]
    pub fn base() -> Self {
        Self(Self::BASE.to_string())
    }

    /// Wraps a string without checking it.
    #[must_use]
    pub fn new(asset: impl Into<String>) -> Self {
        Self(asset.into())
    }

    /// Parses `"base"` or a defining unit hash.
    #[must_use]
    pub fn parse(asset: &str) -> Option<Self> {
        (asset == Self::BASE || is_valid_unit_hash(asset)).then(|| Self(asset.to_string()))
    }

    /// Whether this is the native currency.
    #[must_use]
    pub fn is_base(&self) -> bool {
        self.0 == Self::BASE
    }

    /// The textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Asset {
    fn default() -> Self {
        Self::base()
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// CLUSTER B: UNITS
// =============================================================================

/// A unit: the atomic, hash-identified entry of the DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Hash over the canonical form of every other field.
    pub unit: UnitHash,
    /// Protocol version.
    pub version: String,
    /// Network identifier.
    pub alt: String,
    /// Authors; AA responses have exactly one.
    pub authors: Vec<Author>,
    /// Parent units, sorted.
    pub parent_units: Vec<UnitHash>,
    /// Last stable ball the unit references.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ball_unit: Option<UnitHash>,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Commission paid for the header bytes.
    pub headers_commission: Amount,
    /// Commission paid for the payload bytes.
    pub payload_commission: Amount,
    /// Application messages.
    pub messages: Vec<Message>,
}

impl Unit {
    /// Address of the first author.
    #[must_use]
    pub fn author_address(&self) -> Option<&Address> {
        self.authors.first().map(|a| &a.address)
    }

    /// Whether `address` is among the authors.
    #[must_use]
    pub fn is_authored_by(&self, address: &Address) -> bool {
        self.authors.iter().any(|a| &a.address == address)
    }

    /// Payment messages together with their message index.
    pub fn payments(&self) -> impl Iterator<Item = (usize, &Payment)> {
        self.messages.iter().enumerate().filter_map(|(i, m)| match m {
            Message::Payment(p) => Some((i, p)),
            _ => None,
        })
    }

    /// Per-asset sum of the outputs paid to `address`.
    #[must_use]
    pub fn outputs_to(&self, address: &Address) -> BTreeMap<Asset, Amount> {
        let mut totals = BTreeMap::new();
        for (_, payment) in self.payments() {
            for output in payment.outputs.iter().filter(|o| &o.address == address) {
                *totals.entry(payment.asset.clone()).or_insert(0) += output.amount;
            }
        }
        totals
    }

    /// Distinct output addresses, sorted.
    #[must_use]
    pub fn output_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .payments()
            .flat_map(|(_, p)| p.outputs.iter().map(|o| o.address.clone()))
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Payload of the first `data` message.
    #[must_use]
    pub fn data_payload(&self) -> Option<&serde_json::Value> {
        self.messages.iter().find_map(|m| match m {
            Message::Data(payload) => Some(payload),
            _ => None,
        })
    }

    /// Total commission.
    #[must_use]
    pub fn total_fees(&self) -> Amount {
        self.headers_commission + self.payload_commission
    }
}

/// An author of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Authoring address.
    pub address: Address,
    /// Signatures keyed by path; empty for AA responses.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub authentifiers: BTreeMap<String, String>,
}

impl Author {
    /// An author with no authentifiers.
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            authentifiers: BTreeMap::new(),
        }
    }
}

/// An application message carried by a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "app", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Transfer or issuance of an asset.
    Payment(Payment),
    /// Free-form structured data.
    Data(serde_json::Value),
    /// Oracle posting: feed name to scalar value.
    DataFeed(BTreeMap<String, serde_json::Value>),
    /// Plain text.
    Text(String),
    /// Definition of a new address (plain or AA).
    Definition {
        /// Address being defined.
        address: Address,
        /// The definition itself.
        definition: serde_json::Value,
    },
    /// Attestation of a user profile.
    Attestation {
        /// Attested address.
        address: Address,
        /// Attested fields.
        profile: BTreeMap<String, serde_json::Value>,
    },
    /// Definition of a new asset.
    Asset(AssetDefinition),
}

impl Message {
    /// Application name as it appears on the wire.
    #[must_use]
    pub fn app(&self) -> &'static str {
        match self {
            Self::Payment(_) => "payment",
            Self::Data(_) => "data",
            Self::DataFeed(_) => "data_feed",
            Self::Text(_) => "text",
            Self::Definition { .. } => "definition",
            Self::Attestation { .. } => "attestation",
            Self::Asset(_) => "asset",
        }
    }
}

// =============================================================================
// CLUSTER C: PAYMENTS
// =============================================================================

/// A payment message payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Payment {
    /// Asset transferred; omitted on the wire for the native currency.
    #[serde(default, skip_serializing_if = "Asset::is_base")]
    pub asset: Asset,
    /// Consumed outputs or issuances.
    pub inputs: Vec<Input>,
    /// Created outputs.
    pub outputs: Vec<Output>,
}

/// A payment input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Input {
    /// Spends an earlier output.
    Transfer {
        /// Unit holding the output.
        unit: UnitHash,
        /// Message index within that unit.
        message_index: u32,
        /// Output index within that message.
        output_index: u32,
    },
    /// Issues new coins of an asset.
    Issue {
        /// Issuance serial number.
        serial_number: u64,
        /// Issued amount.
        amount: Amount,
        /// Issuing address.
        address: Address,
    },
}

/// A payment output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Output {
    /// Recipient.
    pub address: Address,
    /// Amount paid.
    pub amount: Amount,
}

/// Reference to an output together with its amount and stability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendableOutput {
    /// Unit holding the output.
    pub unit: UnitHash,
    /// Message index within that unit.
    pub message_index: u32,
    /// Output index within that message.
    pub output_index: u32,
    /// Amount held.
    pub amount: Amount,
    /// MCI of the unit; `None` while unstable.
    pub mci: Option<Mci>,
    /// Whether the unit was authored by an AA.
    pub from_aa: bool,
}

impl SpendableOutput {
    /// Ordering key used by coin selection.
    #[must_use]
    pub fn sort_key(&self) -> (Mci, &UnitHash, u32, u32) {
        (
            self.mci.unwrap_or(Mci::MAX),
            &self.unit,
            self.message_index,
            self.output_index,
        )
    }
}

// =============================================================================
// CLUSTER D: ASSETS
// =============================================================================

/// Properties of an asset as declared in its defining message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AssetDefinition {
    /// Maximum total supply; `None` for uncapped assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cap: Option<Amount>,
    /// Whether payments are private.
    #[serde(default)]
    pub is_private: bool,
    /// Whether holders may transfer between each other.
    #[serde(default)]
    pub is_transferrable: bool,
    /// Whether coins sent to the definer are destroyed.
    #[serde(default)]
    pub auto_destroy: bool,
    /// Whether only fixed denominations exist.
    #[serde(default)]
    pub fixed_denominations: bool,
    /// Whether only the definer may issue.
    #[serde(default)]
    pub issued_by_definer_only: bool,
    /// Whether every transfer needs the definer's cosignature.
    #[serde(default)]
    pub cosigned_by_definer: bool,
    /// Whether spenders must be attested.
    #[serde(default)]
    pub spender_attested: bool,
}

/// An asset as recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInfo {
    /// The asset identifier.
    pub asset: Asset,
    /// Address that defined the asset.
    pub definer_address: Address,
    /// MCI of the defining unit.
    pub mci: Mci,
    /// Declared properties.
    #[serde(flatten)]
    pub definition: AssetDefinition,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(c: char) -> Address {
        Address::new(c.to_string().repeat(32))
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address("ABCDEFGHIJKLMNOPQRSTUVWXYZ234567"));
        assert!(!is_valid_address("abcdefghijklmnopqrstuvwxyz234567"));
        assert!(!is_valid_address("SHORT"));
        assert!(Address::parse("0123456789ABCDEF0123456789ABCDEF").is_some());
    }

    #[test]
    fn test_asset_parsing() {
        assert!(Asset::parse("base").is_some_and(|a| a.is_base()));
        assert!(Asset::parse(&"ab".repeat(32)).is_some());
        assert!(Asset::parse("BASE").is_none());
    }

    #[test]
    fn test_base_asset_omitted_on_wire() {
        let payment = Payment {
            asset: Asset::base(),
            inputs: vec![],
            outputs: vec![Output { address: addr('A'), amount: 5 }],
        };
        let json = serde_json::to_value(&payment).unwrap();
        assert!(json.get("asset").is_none());

        let back: Payment = serde_json::from_value(json).unwrap();
        assert!(back.asset.is_base());
    }

    #[test]
    fn test_outputs_to_sums_per_asset() {
        let unit = Unit {
            unit: UnitHash::new("0".repeat(64)),
            version: "4.0".into(),
            alt: "1".into(),
            authors: vec![Author::new(addr('B'))],
            parent_units: vec![],
            last_ball_unit: None,
            timestamp: 0,
            headers_commission: 0,
            payload_commission: 0,
            messages: vec![Message::Payment(Payment {
                asset: Asset::base(),
                inputs: vec![],
                outputs: vec![
                    Output { address: addr('A'), amount: 5 },
                    Output { address: addr('A'), amount: 7 },
                    Output { address: addr('C'), amount: 1 },
                ],
            })],
        };
        assert_eq!(unit.outputs_to(&addr('A')).get(&Asset::base()), Some(&12));
        assert_eq!(unit.output_addresses(), vec![addr('A'), addr('C')]);
    }

    #[test]
    fn test_message_wire_tag() {
        let msg = Message::Text("hi".into());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["app"], "text");
        assert_eq!(json["payload"], "hi");
    }
}
