//! # Balance and Storage Accounting
//!
//! Pure bookkeeping over the cascade state: balance changes caused by a
//! response unit, storage size changes caused by state variable writes,
//! bounce refunds and the updated-state-vars summary.

use super::composer::ComposedUnit;
use aa_01_formula::domain::{storage_size, Decimal, StateVarEntry, StoredValue, UpdatedStateVar, Value};
use shared_types::{Address, Amount, Asset};
use std::collections::BTreeMap;

/// Change of `aa`'s balances caused by its own response unit.
///
/// Outputs paid back to the AA count as income; transferred inputs as
/// spending. Issued coins and commissions are implied by the difference.
#[must_use]
pub fn balance_delta(composed: &ComposedUnit, aa: &Address) -> BTreeMap<Asset, Amount> {
    let mut delta = composed.unit.outputs_to(aa);
    for (asset, spent) in &composed.spent {
        *delta.entry(asset.clone()).or_insert(0) -= spent;
    }
    delta.retain(|_, d| *d != 0);
    delta
}

/// Storage size change of one AA's cached variables since its invocation started.
#[must_use]
pub fn storage_size_delta(vars: &BTreeMap<String, StateVarEntry>) -> i64 {
    vars.iter()
        .filter(|(_, e)| e.updated)
        .map(|(name, e)| storage_size(name, &e.value) - storage_size(name, &e.old_value))
        .sum()
}

/// Storage size of a persisted variable.
#[must_use]
pub fn stored_size(name: &str, stored: &StoredValue) -> i64 {
    (name.len() + stored.text.len()) as i64
}

/// Fee kept by the AA in `asset` when it bounces.
#[must_use]
pub fn bounce_fee(declared: Option<&BTreeMap<Asset, Amount>>, asset: &Asset, min_bytes_bounce_fee: Amount) -> Amount {
    let declared = declared.and_then(|fees| fees.get(asset).copied());
    match declared {
        Some(fee) => fee,
        None if asset.is_base() => min_bytes_bounce_fee,
        None => 0,
    }
}

/// Amounts returned to the sender of a bounced primary trigger.
///
/// Nothing is returned when the received bytes do not cover the base fee.
#[must_use]
pub fn bounce_refunds(
    received: &BTreeMap<Asset, Amount>,
    declared: Option<&BTreeMap<Asset, Amount>>,
    min_bytes_bounce_fee: Amount,
) -> BTreeMap<Asset, Amount> {
    let base = Asset::base();
    let received_base = received.get(&base).copied().unwrap_or(0);
    if received_base < bounce_fee(declared, &base, min_bytes_bounce_fee) {
        return BTreeMap::new();
    }
    received
        .iter()
        .map(|(asset, amount)| (asset.clone(), amount - bounce_fee(declared, asset, min_bytes_bounce_fee)))
        .filter(|(_, refund)| *refund > 0)
        .collect()
}

fn json_of(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Bool(false) => None,
        v => Some(v.to_json()),
    }
}

fn numeric(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(d) => Some(*d),
        Value::Bool(false) => Some(Decimal::ZERO),
        _ => None,
    }
}

/// Summary of every variable the cascade wrote, against its value before the cascade.
#[must_use]
pub fn updated_state_vars(
    state_vars: &BTreeMap<Address, BTreeMap<String, StateVarEntry>>,
) -> BTreeMap<Address, BTreeMap<String, UpdatedStateVar>> {
    let mut out = BTreeMap::new();
    for (address, vars) in state_vars {
        let updated: BTreeMap<String, UpdatedStateVar> = vars
            .iter()
            .filter(|(_, e)| e.updated)
            .map(|(name, e)| {
                let delta = match (numeric(&e.value), numeric(&e.original_old_value)) {
                    (Some(new), Some(old)) if e.value.is_truthy() || e.original_old_value.is_truthy() => {
                        new.checked_sub(old).ok().map(|d| d.to_json())
                    }
                    _ => None,
                };
                let summary = UpdatedStateVar {
                    value: json_of(&e.value),
                    old_value: json_of(&e.original_old_value),
                    delta,
                };
                (name.clone(), summary)
            })
            .collect();
        if !updated.is_empty() {
            out.insert(address.clone(), updated);
        }
    }
    out
}
