//! # Response Composer
//!
//! Turns substituted response messages into a complete, hashed unit.
//!
//! ## Determinism
//!
//! Everything that goes into a response unit is derived from the cascade:
//! parents, last ball and timestamp come from the chain context, inputs from
//! ordered coin selection, and output lists are sorted by address then
//! amount. Commissions are the byte lengths of the canonical header and
//! payload, recomputed until coin selection no longer changes them.

use super::coin_selection::{select_coins, Issuance};
use serde_json::Value as Json;
use shared_types::{
    canonical_json, compute_unit_hash, Address, Amount, Asset, Author, Input, LedgerError, Message,
    Output, Payment, SpendableOutput, Unit, UnitHash, MAX_CAP,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Protocol version of response units.
pub const RESPONSE_UNIT_VERSION: &str = "4.0";

/// Network identifier of response units.
pub const RESPONSE_UNIT_ALT: &str = "1";

/// Fee recomputation rounds before giving up.
const MAX_FEE_ROUNDS: usize = 10;

/// Why a response unit cannot be built. Every variant bounces the AA.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompositionError {
    /// A message is malformed.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// Two payment messages in the same asset.
    #[error("duplicate payment in asset {0}")]
    DuplicatePayment(Asset),

    /// Not enough coins.
    #[error("not enough funds for asset {asset}: need {needed}, have {available}")]
    NotEnoughFunds { asset: Asset, needed: Amount, available: Amount },

    /// Commissions kept changing.
    #[error("fees did not converge")]
    FeesDidNotConverge,

    /// Hashing failed.
    #[error("{0}")]
    Ledger(#[from] LedgerError),
}

// =============================================================================
// REQUESTED MESSAGES
// =============================================================================

/// An output as written by the AA; `amount: None` sends whatever is left.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedOutput {
    /// Recipient.
    pub address: Address,
    /// Amount, or `None` for send-all.
    pub amount: Option<Amount>,
}

/// A payment message before coin selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Asset paid.
    pub asset: Asset,
    /// Outputs, zero amounts already removed.
    pub outputs: Vec<RequestedOutput>,
}

impl PaymentRequest {
    /// Sum of the fixed outputs.
    #[must_use]
    pub fn fixed_total(&self) -> Amount {
        self.outputs.iter().filter_map(|o| o.amount).sum()
    }

    /// Recipient of the send-all output, if any.
    #[must_use]
    pub fn send_all(&self) -> Option<&Address> {
        self.outputs.iter().find(|o| o.amount.is_none()).map(|o| &o.address)
    }
}

/// One message of a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    /// Payment to be funded.
    Payment(PaymentRequest),
    /// Any other message, copied verbatim.
    Other(Message),
}

/// Messages of a response after filtering.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedMessages {
    /// Remaining messages in template order.
    pub messages: Vec<ResponseMessage>,
    /// Whether payment messages were dropped for having no outputs.
    pub dropped: bool,
}

fn parse_payment(payload: &Json) -> Result<PaymentRequest, CompositionError> {
    let bad = |m: &str| CompositionError::BadMessage(m.to_string());
    let payload = payload.as_object().ok_or_else(|| bad("payment payload is not an object"))?;
    let asset = match payload.get("asset") {
        None => Asset::base(),
        Some(Json::String(s)) => Asset::parse(s).ok_or_else(|| bad("bad asset"))?,
        Some(_) => return Err(bad("bad asset")),
    };
    let outputs = payload
        .get("outputs")
        .and_then(Json::as_array)
        .ok_or_else(|| bad("payment has no outputs array"))?;

    let mut requested = Vec::with_capacity(outputs.len());
    for output in outputs {
        let address = output
            .get("address")
            .and_then(Json::as_str)
            .and_then(Address::parse)
            .ok_or_else(|| bad("bad output address"))?;
        let amount = match output.get("amount") {
            None => None,
            Some(a) => {
                let a = a.as_i64().ok_or_else(|| bad("output amount is not an integer"))?;
                if !(0..=MAX_CAP).contains(&a) {
                    return Err(bad("output amount out of range"));
                }
                if a == 0 {
                    continue;
                }
                Some(a)
            }
        };
        requested.push(RequestedOutput { address, amount });
    }
    if requested.iter().filter(|o| o.amount.is_none()).count() > 1 {
        return Err(bad("more than one send-all output"));
    }
    Ok(PaymentRequest { asset, outputs: requested })
}

/// Parses substituted messages, dropping payments left without outputs.
///
/// # Errors
///
/// Returns the first malformed message.
pub fn parse_messages(messages: &[Json]) -> Result<ParsedMessages, CompositionError> {
    let mut parsed = ParsedMessages::default();
    let mut assets = BTreeSet::new();
    for message in messages {
        let app = message
            .get("app")
            .and_then(Json::as_str)
            .ok_or_else(|| CompositionError::BadMessage("message has no app".into()))?;
        if app == "payment" {
            let payload = message.get("payload").unwrap_or(&Json::Null);
            let payment = parse_payment(payload)?;
            if payment.outputs.is_empty() {
                parsed.dropped = true;
                continue;
            }
            if !assets.insert(payment.asset.clone()) {
                return Err(CompositionError::DuplicatePayment(payment.asset));
            }
            parsed.messages.push(ResponseMessage::Payment(payment));
        } else {
            let other: Message = serde_json::from_value(message.clone())
                .map_err(|e| CompositionError::BadMessage(format!("{app}: {e}")))?;
            parsed.messages.push(ResponseMessage::Other(other));
        }
    }
    Ok(parsed)
}

// =============================================================================
// UNIT ASSEMBLY
// =============================================================================

/// Header fields of a response unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHeader {
    /// The responding AA.
    pub author: Address,
    /// Sorted parents.
    pub parent_units: Vec<UnitHash>,
    /// Last stable ball unit.
    pub last_ball_unit: UnitHash,
    /// Timestamp of the chain context.
    pub timestamp: u64,
}

impl UnitHeader {
    /// Header whose parents are the sorted set of `mc_unit` and `previous`.
    #[must_use]
    pub fn new(author: Address, mc_unit: &UnitHash, previous: &UnitHash, last_ball_unit: UnitHash, timestamp: u64) -> Self {
        let parents: BTreeSet<UnitHash> = [mc_unit.clone(), previous.clone()].into_iter().collect();
        Self { author, parent_units: parents.into_iter().collect(), last_ball_unit, timestamp }
    }
}

/// Funding sources available to a composition.
#[derive(Debug, Clone, Default)]
pub struct Funds {
    /// Spendable outputs per asset.
    pub candidates: BTreeMap<Asset, Vec<SpendableOutput>>,
    /// Issuance rights per asset.
    pub issuance: BTreeMap<Asset, Issuance>,
}

/// A finished response unit with the amounts it moved.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedUnit {
    /// The unit, hashed.
    pub unit: Unit,
    /// Transferred input totals per asset.
    pub spent: BTreeMap<Asset, Amount>,
    /// Issued totals per asset.
    pub issued: BTreeMap<Asset, Amount>,
}

/// Byte length of the canonical header.
#[must_use]
pub fn headers_commission(unit: &Unit) -> Amount {
    let header = serde_json::json!({
        "version": unit.version,
        "alt": unit.alt,
        "authors": unit.authors,
        "parent_units": unit.parent_units,
        "last_ball_unit": unit.last_ball_unit,
        "timestamp": unit.timestamp,
    });
    canonical_json(&header).len() as Amount
}

/// Byte length of the canonical messages.
///
/// # Errors
///
/// Returns a serialization error.
pub fn payload_commission(unit: &Unit) -> Result<Amount, LedgerError> {
    let messages = serde_json::to_value(&unit.messages).map_err(|e| LedgerError::Serialization(e.to_string()))?;
    Ok(canonical_json(&messages).len() as Amount)
}

fn fund_payment(
    request: &PaymentRequest,
    fees: Amount,
    funds: &Funds,
    aa: &Address,
) -> Result<(Payment, Amount, Amount), CompositionError> {
    let empty = Vec::new();
    let candidates = funds.candidates.get(&request.asset).unwrap_or(&empty);
    let fee = if request.asset.is_base() { fees } else { 0 };
    let needed = request.fixed_total() + fee;

    let send_all = request.send_all();
    let target = if send_all.is_some() { None } else { Some(needed) };
    let issuance = funds.issuance.get(&request.asset).copied().unwrap_or_default();
    let selection = select_coins(&request.asset, candidates, target, issuance, aa)?;
    if selection.total() < needed {
        return Err(CompositionError::NotEnoughFunds {
            asset: request.asset.clone(),
            needed,
            available: selection.total(),
        });
    }

    let remainder = selection.total() - needed;
    let mut outputs: Vec<Output> = request
        .outputs
        .iter()
        .filter_map(|o| o.amount.map(|amount| Output { address: o.address.clone(), amount }))
        .collect();
    if remainder > 0 {
        let address = send_all.unwrap_or(aa).clone();
        outputs.push(Output { address, amount: remainder });
    }
    outputs.sort();

    let payment = Payment { asset: request.asset.clone(), inputs: selection.inputs, outputs };
    Ok((payment, selection.spent, selection.issued))
}

/// Builds and hashes a response unit.
///
/// A base payment carrying only change is added when the messages have no
/// base payment, since commissions are always paid in base.
///
/// # Errors
///
/// Returns the reason the AA cannot afford or express the response.
pub fn compose_unit(
    header: &UnitHeader,
    messages: &[ResponseMessage],
    funds: &Funds,
) -> Result<ComposedUnit, CompositionError> {
    let mut messages = messages.to_vec();
    let has_base = messages.iter().any(|m| matches!(m, ResponseMessage::Payment(p) if p.asset.is_base()));
    if !has_base {
        messages.push(ResponseMessage::Payment(PaymentRequest { asset: Asset::base(), outputs: vec![] }));
    }

    let mut fees = 0;
    for _ in 0..MAX_FEE_ROUNDS {
        let mut spent = BTreeMap::new();
        let mut issued = BTreeMap::new();
        let mut built = Vec::with_capacity(messages.len());
        for message in &messages {
            match message {
                ResponseMessage::Payment(request) => {
                    let (payment, s, i) = fund_payment(request, fees, funds, &header.author)?;
                    spent.insert(request.asset.clone(), s);
                    if i > 0 {
                        issued.insert(request.asset.clone(), i);
                    }
                    built.push(Message::Payment(payment));
                }
                ResponseMessage::Other(m) => built.push(m.clone()),
            }
        }

        let mut unit = Unit {
            unit: UnitHash::default(),
            version: RESPONSE_UNIT_VERSION.to_string(),
            alt: RESPONSE_UNIT_ALT.to_string(),
            authors: vec![Author::new(header.author.clone())],
            parent_units: header.parent_units.clone(),
            last_ball_unit: Some(header.last_ball_unit.clone()),
            timestamp: header.timestamp,
            headers_commission: 0,
            payload_commission: 0,
            messages: built,
        };
        unit.headers_commission = headers_commission(&unit);
        unit.payload_commission = payload_commission(&unit)?;
        if unit.total_fees() == fees {
            unit.unit = compute_unit_hash(&unit)?;
            return Ok(ComposedUnit { unit, spent, issued });
        }
        fees = unit.total_fees();
    }
    Err(CompositionError::FeesDidNotConverge)
}

// =============================================================================
// STRUCTURAL CHECKS
// =============================================================================

/// Checks a response unit against the amounts of the outputs it spends.
///
/// # Errors
///
/// Returns the first broken rule.
pub fn verify_unit(unit: &Unit, input_amounts: &BTreeMap<(UnitHash, u32, u32), Amount>) -> Result<(), String> {
    if unit.authors.len() != 1 {
        return Err("response units have exactly one author".into());
    }
    let hash = compute_unit_hash(unit).map_err(|e| e.to_string())?;
    if hash != unit.unit {
        return Err(format!("wrong unit hash {}, expected {hash}", unit.unit));
    }
    let mut seen = BTreeSet::new();
    for (_, payment) in unit.payments() {
        if payment.outputs.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!("outputs of {} are not sorted", payment.asset));
        }
        if payment.outputs.iter().any(|o| o.amount <= 0) {
            return Err(format!("non-positive output in {}", payment.asset));
        }
        let mut inputs_total: Amount = 0;
        for input in &payment.inputs {
            match input {
                Input::Transfer { unit: u, message_index, output_index } => {
                    let key = (u.clone(), *message_index, *output_index);
                    let amount = input_amounts.get(&key).ok_or_else(|| format!("input {u}:{message_index}:{output_index} not found"))?;
                    if !seen.insert(key) {
                        return Err(format!("input {u}:{message_index}:{output_index} spent twice"));
                    }
                    inputs_total += amount;
                }
                Input::Issue { amount, .. } => inputs_total += amount,
            }
        }
        let outputs_total: Amount = payment.outputs.iter().map(|o| o.amount).sum();
        let fees = if payment.asset.is_base() { unit.total_fees() } else { 0 };
        if inputs_total != outputs_total + fees {
            return Err(format!(
                "unbalanced payment in {}: inputs {inputs_total}, outputs {outputs_total}, fees {fees}",
                payment.asset
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(c: char) -> Address {
        Address::new(c.to_string().repeat(32))
    }

    fn coin(c: char, amount: Amount) -> SpendableOutput {
        SpendableOutput {
            unit: UnitHash::new(c.to_string().repeat(64)),
            message_index: 0,
            output_index: 0,
            amount,
            mci: Some(1),
            from_aa: false,
        }
    }

    fn header() -> UnitHeader {
        UnitHeader::new(addr('A'), &UnitHash::new("b".repeat(64)), &UnitHash::new("a".repeat(64)), UnitHash::new("c".repeat(64)), 1000)
    }

    fn funds(amount: Amount) -> Funds {
        let mut f = Funds::default();
        f.candidates.insert(Asset::base(), vec![coin('1', amount)]);
        f
    }

    fn amounts(f: &Funds) -> BTreeMap<(UnitHash, u32, u32), Amount> {
        f.candidates.values().flatten().map(|c| ((c.unit.clone(), c.message_index, c.output_index), c.amount)).collect()
    }

    #[test]
    fn test_parents_are_sorted() {
        let h = header();
        assert_eq!(h.parent_units, vec![UnitHash::new("a".repeat(64)), UnitHash::new("b".repeat(64))]);
    }

    #[test]
    fn test_parse_strips_zero_outputs_and_drops_empty_payments() {
        let messages = vec![
            json!({"app": "payment", "payload": {"outputs": [{"address": addr('B').as_str(), "amount": 0}]}}),
            json!({"app": "data", "payload": {"k": 1}}),
        ];
        let parsed = parse_messages(&messages).unwrap();
        assert!(parsed.dropped);
        assert_eq!(parsed.messages.len(), 1);
        assert!(matches!(parsed.messages[0], ResponseMessage::Other(Message::Data(_))));
    }

    #[test]
    fn test_parse_rejects_bad_payments() {
        let two_send_all = vec![json!({"app": "payment", "payload": {"outputs": [
            {"address": addr('B').as_str()}, {"address": addr('C').as_str()}
        ]}})];
        assert!(parse_messages(&two_send_all).is_err());

        let bad_address = vec![json!({"app": "payment", "payload": {"outputs": [{"address": "nope", "amount": 1}]}})];
        assert!(parse_messages(&bad_address).is_err());

        let payment = json!({"app": "payment", "payload": {"outputs": [{"address": addr('B').as_str(), "amount": 1}]}});
        assert!(matches!(
            parse_messages(&[payment.clone(), payment]),
            Err(CompositionError::DuplicatePayment(_))
        ));
    }

    #[test]
    fn test_composed_unit_balances_and_verifies() {
        let request = PaymentRequest {
            asset: Asset::base(),
            outputs: vec![RequestedOutput { address: addr('B'), amount: Some(5000) }],
        };
        let f = funds(100_000);
        let composed = compose_unit(&header(), &[ResponseMessage::Payment(request)], &f).unwrap();
        let unit = &composed.unit;
        assert!(unit.total_fees() > 0);
        assert_eq!(unit.headers_commission, headers_commission(unit));
        assert_eq!(unit.payload_commission, payload_commission(unit).unwrap());
        assert_eq!(unit.outputs_to(&addr('B'))[&Asset::base()], 5000);
        assert_eq!(unit.outputs_to(&addr('A'))[&Asset::base()], 100_000 - 5000 - unit.total_fees());
        assert_eq!(composed.spent[&Asset::base()], 100_000);
        verify_unit(unit, &amounts(&f)).unwrap();
    }

    #[test]
    fn test_send_all_takes_the_remainder() {
        let request = PaymentRequest {
            asset: Asset::base(),
            outputs: vec![
                RequestedOutput { address: addr('C'), amount: None },
                RequestedOutput { address: addr('B'), amount: Some(1000) },
            ],
        };
        let composed = compose_unit(&header(), &[ResponseMessage::Payment(request)], &funds(50_000)).unwrap();
        let unit = composed.unit;
        assert!(unit.outputs_to(&addr('A')).is_empty());
        assert_eq!(unit.outputs_to(&addr('C'))[&Asset::base()], 50_000 - 1000 - unit.total_fees());
    }

    #[test]
    fn test_data_only_response_pays_fees_from_base() {
        let data = ResponseMessage::Other(Message::Data(json!({"x": 1})));
        let composed = compose_unit(&header(), &[data], &funds(10_000)).unwrap();
        assert_eq!(composed.unit.messages.len(), 2);
        assert_eq!(composed.unit.outputs_to(&addr('A'))[&Asset::base()], 10_000 - composed.unit.total_fees());
    }

    #[test]
    fn test_not_enough_funds() {
        let request = PaymentRequest {
            asset: Asset::base(),
            outputs: vec![RequestedOutput { address: addr('B'), amount: Some(5000) }],
        };
        let err = compose_unit(&header(), &[ResponseMessage::Payment(request)], &funds(5000)).unwrap_err();
        assert!(matches!(err, CompositionError::NotEnoughFunds { .. }));
    }

    #[test]
    fn test_composition_is_deterministic() {
        let request = PaymentRequest {
            asset: Asset::base(),
            outputs: vec![
                RequestedOutput { address: addr('C'), amount: Some(7) },
                RequestedOutput { address: addr('B'), amount: Some(9) },
            ],
        };
        let messages = [ResponseMessage::Payment(request)];
        let a = compose_unit(&header(), &messages, &funds(20_000)).unwrap();
        let b = compose_unit(&header(), &messages, &funds(20_000)).unwrap();
        assert_eq!(a.unit, b.unit);
        let outputs = &a.unit.payments().next().unwrap().1.outputs;
        assert!(outputs.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let request = PaymentRequest {
            asset: Asset::base(),
            outputs: vec![RequestedOutput { address: addr('B'), amount: Some(5000) }],
        };
        let f = funds(100_000);
        let mut unit = compose_unit(&header(), &[ResponseMessage::Payment(request)], &f).unwrap().unit;
        if let Message::Payment(p) = &mut unit.messages[0] {
            p.outputs[0].amount += 1;
        }
        assert!(verify_unit(&unit, &amounts(&f)).is_err());
        unit.unit = compute_unit_hash(&unit).unwrap();
        assert!(verify_unit(&unit, &amounts(&f)).unwrap_err().contains("unbalanced"));
    }
}
