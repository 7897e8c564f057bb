//! Static costs of remote getters, resolved through the ledger.
//!
//! Definition intake and remote getter calls both price getters here, so
//! the complexity charged when a definition is posted is the one checked
//! when the call runs.

use crate::config::AaConfig;
use crate::domain::template::{AaDefinition, AaDefinitionKind};
use crate::errors::EvalError;
use crate::ports::outbound::LedgerReader;
use crate::validator::{validate_getters, Complexity};
use futures::future::{BoxFuture, FutureExt};
use shared_types::{Address, Mci};
use std::collections::BTreeMap;

/// Levels of literal remote getter calls followed below the priced AA.
pub const MAX_GETTER_DEPTH: usize = 4;

/// Getter complexity keyed by `(aa, getter)`.
pub type GetterCosts = BTreeMap<(Address, String), Complexity>;

/// Code of `address` as of `mci`, with a parameterized AA replaced by its
/// base and the parameters it runs under.
///
/// # Errors
///
/// Fails when the base AA is missing or itself parameterized.
pub async fn plain_definition<L: LedgerReader + ?Sized>(
    ledger: &L,
    address: &Address,
    mci: Mci,
) -> Result<Option<(AaDefinition, BTreeMap<String, serde_json::Value>)>, EvalError> {
    let Some(record) = ledger.read_aa_definition(address).await?.filter(|r| r.mci <= mci) else {
        return Ok(None);
    };
    match record.definition {
        AaDefinitionKind::Plain(def) => Ok(Some((def, BTreeMap::new()))),
        AaDefinitionKind::Parameterized { base_aa, params } => {
            let Some(base) = ledger.read_aa_definition(&base_aa).await?.filter(|r| r.mci <= mci) else {
                return Err(EvalError::failed(format!("base AA {base_aa} not found")));
            };
            let AaDefinitionKind::Plain(def) = base.definition else {
                return Err(EvalError::failed(format!("base AA {base_aa} is itself parameterized")));
            };
            Ok(Some((def, params)))
        }
    }
}

/// Costs of the getters of `address` and of every getter they reach through
/// literal remote calls, as validated at `mci`.
///
/// # Errors
///
/// Ledger failures, a broken base AA, or getters that fail validation.
pub async fn getter_costs<L: LedgerReader + ?Sized>(
    ledger: &L,
    config: &AaConfig,
    address: &Address,
    mci: Mci,
) -> Result<GetterCosts, EvalError> {
    costs_at_depth(ledger, config, address, mci, 0).await
}

fn costs_at_depth<'a, L: LedgerReader + ?Sized>(
    ledger: &'a L,
    config: &'a AaConfig,
    address: &'a Address,
    mci: Mci,
    depth: usize,
) -> BoxFuture<'a, Result<GetterCosts, EvalError>> {
    async move {
        let mut costs = GetterCosts::new();
        let Some((def, _)) = plain_definition(ledger, address, mci).await? else {
            return Ok(costs);
        };
        let Some(getters) = def.getters else {
            return Ok(costs);
        };
        if depth < MAX_GETTER_DEPTH {
            for target in getters.literal_remote_targets() {
                let Some(target) = Address::parse(&target) else { continue };
                if &target != address {
                    costs.extend(costs_at_depth(ledger, config, &target, mci, depth + 1).await?);
                }
            }
        }
        let own = validate_getters(&getters, mci, config, &costs)?;
        costs.extend(own.into_iter().map(|(name, c)| ((address.clone(), name), c)));
        Ok(costs)
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryLedgerReader;
    use crate::domain::ast::Expr;
    use crate::domain::template::{AaDefinitionRecord, Template};
    use shared_types::UnitHash;

    fn addr(c: char) -> Address {
        Address::new(c.to_string().repeat(32))
    }

    fn record(address: &Address, definition: AaDefinitionKind, mci: Mci) -> AaDefinitionRecord {
        AaDefinitionRecord { address: address.clone(), definition, unit: UnitHash::new("d".repeat(64)), mci }
    }

    fn with_getters(getters: Expr) -> AaDefinition {
        let mut def = AaDefinition::with_messages(Template::Array { items: vec![] });
        def.getters = Some(getters);
        def
    }

    fn price_getter() -> Expr {
        Expr::statements(vec![Expr::assign(
            "price",
            Expr::FuncDeclaration { args: vec![], body: Box::new(Expr::num(42)) },
        )])
    }

    #[tokio::test]
    async fn test_costs_follow_parameterized_aa_to_its_base() {
        let ledger = InMemoryLedgerReader::default();
        let (base, child) = (addr('B'), addr('C'));
        ledger.update(|d| {
            d.add_aa(record(&base, AaDefinitionKind::Plain(with_getters(price_getter())), 1));
            d.add_aa(record(&child, AaDefinitionKind::Parameterized { base_aa: base.clone(), params: BTreeMap::new() }, 2));
        });

        let costs = getter_costs(&ledger, &AaConfig::default(), &child, 5).await.unwrap();
        assert!(costs.contains_key(&(child.clone(), "price".to_string())));
    }

    #[tokio::test]
    async fn test_definitions_after_mci_are_invisible() {
        let ledger = InMemoryLedgerReader::default();
        let aa = addr('G');
        ledger.update(|d| {
            d.add_aa(record(&aa, AaDefinitionKind::Plain(with_getters(price_getter())), 10));
        });

        let config = AaConfig::default();
        assert!(getter_costs(&ledger, &config, &aa, 9).await.unwrap().is_empty());
        assert_eq!(getter_costs(&ledger, &config, &aa, 10).await.unwrap().len(), 1);
    }
}
