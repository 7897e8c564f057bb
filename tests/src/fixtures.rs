//! # Test Fixtures
//!
//! Deterministic addresses, trigger units and AA definitions shared by the
//! integration scenarios and the benchmarks.

use aa_01_formula::config::AaConfig;
use aa_01_formula::domain::ast::{AssignOp, CmpOp, SearchParam, TriggerField};
use aa_01_formula::domain::{AaDefinition, AaDefinitionKind, AaDefinitionRecord, ChainContext, Expr, Template};
use aa_02_trigger_handler::adapters::InMemoryAaLedger;
use aa_02_trigger_handler::service::AaService;
use serde_json::json;
use shared_types::{compute_unit_hash, Address, Amount, Asset, Author, Mci, Message, Output, Payment, Unit, UnitHash};
use std::sync::Arc;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Address made of one repeated character.
pub fn addr(c: char) -> Address {
    Address::new(c.to_string().repeat(32))
}

/// Unit hash made of one repeated character.
pub fn hash(c: char) -> UnitHash {
    UnitHash::new(c.to_string().repeat(64))
}

// =============================================================================
// LEDGER
// =============================================================================

/// Main chain context used for every MCI in the fixtures.
pub fn context(mci: Mci) -> ChainContext {
    ChainContext { mci, timestamp: 1_700_000_000 + mci, mc_unit: hash('m'), last_ball_unit: hash('b') }
}

/// Empty ledger with main chain contexts for MCIs 1 to 100.
pub fn ledger() -> InMemoryAaLedger {
    let ledger = InMemoryAaLedger::new();
    for mci in 1..=100 {
        ledger.set_chain_context(context(mci));
    }
    ledger
}

/// Service over a fresh [`ledger`].
pub fn service(config: AaConfig) -> AaService<InMemoryAaLedger> {
    AaService::new(Arc::new(ledger()), config)
}

/// Unit authored by `from` paying `amount` bytes to `to`, with optional data.
pub fn paying_with_data(from: char, to: &Address, amount: Amount, data: Option<serde_json::Value>, nonce: u64) -> Unit {
    let mut messages = vec![Message::Payment(Payment {
        asset: Asset::base(),
        inputs: vec![],
        outputs: vec![Output { address: to.clone(), amount }],
    })];
    if let Some(data) = data {
        messages.push(Message::Data(data));
    }
    let mut unit = Unit {
        unit: UnitHash::default(),
        version: "4.0".into(),
        alt: "1".into(),
        authors: vec![Author::new(addr(from))],
        parent_units: vec![hash('p')],
        last_ball_unit: None,
        timestamp: nonce,
        headers_commission: 0,
        payload_commission: 0,
        messages,
    };
    unit.unit = compute_unit_hash(&unit).expect("fixture unit hashes");
    unit
}

/// Unit authored by `from` paying `amount` bytes to `to`.
pub fn paying(from: char, to: &Address, amount: Amount) -> Unit {
    paying_with_data(from, to, amount, None, 1)
}

// =============================================================================
// DEFINITIONS
// =============================================================================

/// Plain definition record stable at MCI 1.
pub fn plain(address: &Address, definition: AaDefinition) -> AaDefinitionRecord {
    AaDefinitionRecord {
        address: address.clone(),
        definition: AaDefinitionKind::Plain(definition),
        unit: hash('d'),
        mci: 1,
    }
}

/// `var[name] op= value`
pub fn set_var(name: &str, op: AssignOp, value: Expr) -> Expr {
    Expr::StateVarAssign { name: Box::new(Expr::str(name)), op, value: Box::new(value) }
}

/// `trigger.output[[asset=base]]`
pub fn received_bytes() -> Expr {
    Expr::TriggerOutput { asset: Box::new(Expr::str("base")) }
}

/// `trigger.address`
pub fn trigger_address() -> Expr {
    Expr::Trigger { field: TriggerField::Address }
}

/// `bounce(message)`
pub fn bounce(message: &str) -> Expr {
    Expr::Bounce { message: Box::new(Expr::str(message)) }
}

/// `data_feed[[oracles=oracle, feed_name=feed]]`
pub fn data_feed(oracle: &Address, feed: &str) -> Expr {
    let param = |name: &str, value: &str| SearchParam { name: name.into(), op: CmpOp::Eq, value: Expr::str(value) };
    Expr::DataFeed { params: vec![param("oracles", oracle.as_str()), param("feed_name", feed)] }
}

/// `data_feed[[oracles=oracle, feed_name=feed, feed_value>threshold]]`
pub fn data_feed_above(oracle: &Address, feed: &str, threshold: i64) -> Expr {
    let Expr::DataFeed { mut params } = data_feed(oracle, feed) else {
        unreachable!("data_feed builds a data feed lookup")
    };
    params.push(SearchParam { name: "feed_value".into(), op: CmpOp::Gt, value: Expr::num(threshold) });
    Expr::DataFeed { params }
}

/// Base payment message with one output per `(address, amount)` pair.
pub fn payment(outputs: Vec<(Expr, Expr)>) -> Template {
    let outputs = outputs
        .into_iter()
        .map(|(address, amount)| {
            Template::object(vec![("address", Template::formula(address)), ("amount", Template::formula(amount))])
        })
        .collect();
    Template::object(vec![
        ("app", Template::literal(json!("payment"))),
        (
            "payload",
            Template::object(vec![
                ("asset", Template::literal(json!("base"))),
                ("outputs", Template::Array { items: outputs }),
            ]),
        ),
    ])
}

/// Definition made of `messages` in order.
pub fn messages(items: Vec<Template>) -> AaDefinition {
    AaDefinition::with_messages(Template::Array { items })
}

/// Counts triggers in `count` and does nothing else.
pub fn counter() -> AaDefinition {
    messages(vec![Template::state_message(Expr::statements(vec![set_var("count", AssignOp::Add, Expr::num(1))]))])
}
