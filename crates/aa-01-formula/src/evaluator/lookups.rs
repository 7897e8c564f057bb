//! Ledger lookups: data feeds, attestations, balances, units, definitions,
//! assets, signed packages and remote getter calls.
//!
//! Every lookup sees the response units composed earlier in the cascade
//! before it falls back to stable ledger data bounded by the cascade MCI.

use super::{arith, builtins, fail, getters, EvalMode, EvalResult, Evaluator, Interrupt, Invocation};
use crate::domain::ast::{CmpOp, Expr, SearchParam};
use crate::domain::decimal::{is_numeric_literal, Decimal};
use crate::domain::template::{AaDefinition, AaDefinitionRecord};
use crate::domain::value::Value;
use crate::errors::EvalError;
use crate::ports::outbound::{AttestationQuery, DataFeedQuery, LedgerReader};
use shared_types::{address_from_definition, canonical_json, Address, Asset, Message, UnitHash};
use std::collections::BTreeMap;
use tracing::debug;

/// Evaluated search parameters.
struct Search {
    values: BTreeMap<String, (CmpOp, Value)>,
}

impl Search {
    fn text(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|(_, v)| v.to_text())
    }

    fn addresses(&self, name: &str) -> Result<Vec<Address>, Interrupt> {
        let Some(text) = self.text(name) else {
            return fail(format!("missing {name}"));
        };
        text.split(':')
            .map(|a| Address::parse(a).ok_or_else(|| Interrupt::Error(EvalError::failed(format!("bad address {a}")))))
            .collect()
    }

    fn ifnone(&self) -> Option<Value> {
        self.values.get("ifnone").map(|(_, v)| v.clone())
    }

    fn abort_if_several(&self) -> bool {
        self.text("ifseveral").as_deref() == Some("abort")
    }

    fn auto_type(&self) -> bool {
        self.text("type").as_deref() != Some("string")
    }
}

/// Converts a posted or attested scalar to a formula value.
fn posted_value(json: &serde_json::Value, auto_type: bool) -> Result<Value, EvalError> {
    match json {
        serde_json::Value::String(s) if auto_type && is_numeric_literal(s) => Ok(Value::Number(s.parse()?)),
        serde_json::Value::Number(n) if !auto_type => Ok(Value::Str(n.to_string())),
        other => Ok(Value::from_json(other)?),
    }
}

/// Whether a feed value passes the `feed_value` filter. Numeric filters only
/// match numeric postings; string filters compare text.
fn feed_value_matches(posted: &serde_json::Value, op: CmpOp, wanted: &Value) -> bool {
    let candidate = match (posted, wanted) {
        (serde_json::Value::Number(n), Value::Number(_)) => match n.to_string().parse::<Decimal>() {
            Ok(d) => Value::Number(d),
            Err(_) => return false,
        },
        (serde_json::Value::String(s), Value::Number(_)) => match Decimal::parse_strict(s) {
            Some(d) => Value::Number(d),
            None => return false,
        },
        (posted, _) => Value::Str(match posted {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    };
    let wanted = match wanted {
        Value::Number(_) => wanted.clone(),
        other => Value::Str(other.to_text()),
    };
    arith::compare(op, &candidate, &wanted).unwrap_or(false)
}

struct FeedCandidate {
    value: serde_json::Value,
    unit: UnitHash,
}

impl<L: LedgerReader + ?Sized> Evaluator<'_, L> {
    async fn search(&mut self, params: &[SearchParam]) -> Result<Search, Interrupt> {
        let mut values = BTreeMap::new();
        for p in params {
            let v = self.eval(&p.value).await?;
            values.insert(p.name.clone(), (p.op, v));
        }
        Ok(Search { values })
    }

    // -------------------------------------------------------------------------
    // Data feeds
    // -------------------------------------------------------------------------

    pub(super) async fn data_feed(&mut self, params: &[SearchParam], exists_only: bool) -> EvalResult {
        let search = self.search(params).await?;
        let oracles = search.addresses("oracles")?;
        let feed_name = search.text("feed_name").unwrap_or_default();
        let min_mci = match search.values.get("min_mci") {
            Some((_, v)) => arith::to_mci(v, "min_mci")?,
            None => 0,
        };

        let mut candidates: Vec<FeedCandidate> = Vec::new();
        for unit in self.state.response_units.iter().rev() {
            if !oracles.iter().any(|o| unit.is_authored_by(o)) {
                continue;
            }
            for message in &unit.messages {
                if let Message::DataFeed(feeds) = message {
                    if let Some(value) = feeds.get(&feed_name) {
                        candidates.push(FeedCandidate { value: value.clone(), unit: unit.unit.clone() });
                    }
                }
            }
        }
        let query = DataFeedQuery { oracles, feed_name: feed_name.clone(), min_mci, max_mci: self.state.context.mci };
        for record in self.ledger.read_data_feeds(&query).await? {
            candidates.push(FeedCandidate { value: record.value, unit: record.unit });
        }

        if let Some((op, wanted)) = search.values.get("feed_value") {
            candidates.retain(|c| feed_value_matches(&c.value, *op, wanted));
        }

        if exists_only {
            return Ok(Value::Bool(!candidates.is_empty()));
        }
        if candidates.len() > 1 && search.abort_if_several() {
            return fail(format!("several values found for data feed {feed_name}"));
        }
        let Some(found) = candidates.into_iter().next() else {
            return match search.ifnone() {
                Some(v) => Ok(v),
                None => fail(format!("data feed {feed_name} not found")),
            };
        };
        if search.text("what").as_deref() == Some("unit") {
            return Ok(Value::Str(found.unit.as_str().to_string()));
        }
        Ok(posted_value(&found.value, search.auto_type())?)
    }

    // -------------------------------------------------------------------------
    // Attestations
    // -------------------------------------------------------------------------

    pub(super) async fn attestation(&mut self, params: &[SearchParam], field: Option<&Expr>) -> EvalResult {
        let search = self.search(params).await?;
        let attestors = search.addresses("attestors")?;
        let address = search.addresses("address")?.into_iter().next();
        let Some(address) = address else {
            return fail("missing address");
        };
        let field = match field {
            Some(f) => Some(self.eval(f).await?.to_text()),
            None => None,
        };

        let mut profiles: Vec<BTreeMap<String, serde_json::Value>> = Vec::new();
        for unit in self.state.response_units.iter().rev() {
            if !attestors.iter().any(|a| unit.is_authored_by(a)) {
                continue;
            }
            for message in &unit.messages {
                if let Message::Attestation { address: attested, profile } = message {
                    if attested == &address {
                        profiles.push(profile.clone());
                    }
                }
            }
        }
        let query = AttestationQuery { attestors, address, max_mci: self.state.context.mci };
        profiles.extend(self.ledger.read_attestations(&query).await?.into_iter().map(|r| r.profile));

        if profiles.len() > 1 && search.abort_if_several() {
            return fail("several attestations found");
        }
        let not_found = search.ifnone().unwrap_or(Value::Bool(false));
        let Some(profile) = profiles.into_iter().next() else {
            return Ok(not_found);
        };
        match field {
            Some(field) => match profile.get(&field) {
                Some(v) => Ok(posted_value(v, search.auto_type())?),
                None => Ok(not_found),
            },
            None => {
                let json = serde_json::Value::Object(profile.into_iter().collect());
                Ok(Value::from_json(&json)?)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Balances
    // -------------------------------------------------------------------------

    pub(super) async fn balance(&mut self, address: Option<Address>, asset: &Asset) -> EvalResult {
        let own = address.as_ref().map_or(true, |a| a == &self.inv.address);
        let address = address.unwrap_or_else(|| self.inv.address.clone());
        let cached = self.state.balances.get(&address).and_then(|b| b.get(asset)).copied();
        let mut amount = match cached {
            Some(amount) => amount,
            None => {
                let amount = self.ledger.read_balance(&address, asset).await?;
                if own {
                    self.state.balances.entry(address.clone()).or_default().insert(asset.clone(), amount);
                }
                amount
            }
        };
        if own && self.state.context.mci < self.config.activation.bug_compatible_balance_mci {
            amount -= self.inv.trigger.amount(asset);
        }
        Ok(Value::Number(Decimal::from(amount)))
    }

    // -------------------------------------------------------------------------
    // Units, definitions, assets
    // -------------------------------------------------------------------------

    pub(super) async fn unit_lookup(&mut self, hash: &UnitHash) -> EvalResult {
        let unit = match self.state.response_unit(hash) {
            Some(unit) => Some(unit.clone()),
            None => self
                .ledger
                .read_unit(hash)
                .await?
                .filter(|stored| stored.mci.is_some_and(|m| m <= self.state.context.mci))
                .map(|stored| stored.unit),
        };
        match unit {
            Some(unit) => {
                let json = serde_json::to_value(&unit).map_err(|e| EvalError::failed(e.to_string()))?;
                Ok(Value::from_json(&json)?)
            }
            None => Ok(Value::Bool(false)),
        }
    }

    /// The AA definition of `address` if it is stable at the cascade MCI.
    pub(super) async fn aa_definition_at_mci(
        &self,
        address: &Address,
    ) -> Result<Option<AaDefinitionRecord>, EvalError> {
        Ok(self
            .ledger
            .read_aa_definition(address)
            .await?
            .filter(|record| record.mci <= self.state.context.mci))
    }

    pub(super) async fn definition(&mut self, address: &Address) -> EvalResult {
        if let Some(record) = self.aa_definition_at_mci(address).await? {
            let body = serde_json::to_value(&record.definition).map_err(|e| EvalError::failed(e.to_string()))?;
            return Ok(Value::from_json(&serde_json::json!(["autonomous agent", body]))?);
        }
        match self.ledger.read_definition(address).await? {
            Some(definition) => Ok(Value::from_json(&definition)?),
            None => Ok(Value::Bool(false)),
        }
    }

    pub(super) async fn asset_info(&mut self, asset: &Asset, field: &str) -> EvalResult {
        let info = if asset.is_base() {
            None
        } else {
            self.ledger
                .read_asset(asset)
                .await?
                .filter(|info| info.mci <= self.state.context.mci)
        };
        let Some(info) = info else {
            return match field {
                "exists" | "cap" | "is_private" | "is_transferrable" | "auto_destroy" | "fixed_denominations"
                | "issued_by_definer_only" | "cosigned_by_definer" | "spender_attested" | "definer_address" => {
                    Ok(Value::Bool(false))
                }
                other => fail(format!("unknown asset field {other}")),
            };
        };
        let d = &info.definition;
        Ok(match field {
            "exists" => Value::Bool(true),
            "cap" => d.cap.map_or(Value::Bool(false), |cap| Value::Number(Decimal::from(cap))),
            "is_private" => Value::Bool(d.is_private),
            "is_transferrable" => Value::Bool(d.is_transferrable),
            "auto_destroy" => Value::Bool(d.auto_destroy),
            "fixed_denominations" => Value::Bool(d.fixed_denominations),
            "issued_by_definer_only" => Value::Bool(d.issued_by_definer_only),
            "cosigned_by_definer" => Value::Bool(d.cosigned_by_definer),
            "spender_attested" => Value::Bool(d.spender_attested),
            "definer_address" => Value::Str(info.definer_address.as_str().to_string()),
            other => return fail(format!("unknown asset field {other}")),
        })
    }

    // -------------------------------------------------------------------------
    // Signed packages
    // -------------------------------------------------------------------------

    /// `is_valid_signed_package(package, address)`: a single-author package
    /// `{signed_message, authors: [{address, authentifiers: {r}, definition?}], last_ball_unit?}`
    /// whose author is `address` and whose definition is a single key.
    pub(super) async fn signed_package(&mut self, args: &[Value]) -> EvalResult {
        let [package, address] = args else {
            return fail("is_valid_signed_package takes two arguments");
        };
        let package = package.to_json();
        let address = address.to_text();
        let Some(author) = package
            .get("authors")
            .and_then(serde_json::Value::as_array)
            .filter(|authors| authors.len() == 1)
            .and_then(|authors| authors.first())
        else {
            return Ok(Value::Bool(false));
        };
        let Some(signed_message) = package.get("signed_message") else {
            return Ok(Value::Bool(false));
        };
        if author.get("address").and_then(serde_json::Value::as_str) != Some(address.as_str()) {
            return Ok(Value::Bool(false));
        }
        let Some(parsed) = Address::parse(&address) else {
            return Ok(Value::Bool(false));
        };

        if let Some(last_ball_unit) = package.get("last_ball_unit").and_then(serde_json::Value::as_str) {
            let stable = self
                .ledger
                .read_unit(&UnitHash::new(last_ball_unit))
                .await?
                .and_then(|stored| stored.mci)
                .is_some_and(|m| m <= self.state.context.mci);
            if !stable {
                return Ok(Value::Bool(false));
            }
        }

        let definition = match author.get("definition") {
            Some(inline) => {
                if address_from_definition(inline) != parsed {
                    return Ok(Value::Bool(false));
                }
                inline.clone()
            }
            None => match self.ledger.read_definition(&parsed).await? {
                Some(stored) => stored,
                None => return Ok(Value::Bool(false)),
            },
        };
        let pubkey = match definition.as_array().map(Vec::as_slice) {
            Some([op, params]) if op == "sig" => params.get("pubkey").and_then(serde_json::Value::as_str),
            _ => None,
        };
        let signature = author
            .get("authentifiers")
            .and_then(|a| a.get("r"))
            .and_then(serde_json::Value::as_str);
        let (Some(pubkey), Some(signature)) = (pubkey, signature) else {
            return Ok(Value::Bool(false));
        };
        Ok(Value::Bool(builtins::is_valid_sig(&canonical_json(signed_message), pubkey, signature)))
    }

    // -------------------------------------------------------------------------
    // Remote getters
    // -------------------------------------------------------------------------

    /// Plain definition of `address` with the params it runs under.
    async fn resolve_definition(&self, address: &Address) -> Result<Option<(AaDefinition, Value)>, EvalError> {
        let Some((def, params)) = getters::plain_definition(self.ledger, address, self.state.context.mci).await? else {
            return Ok(None);
        };
        let params = serde_json::Value::Object(params.into_iter().collect());
        Ok(Some((def, Value::from_json(&params)?)))
    }

    pub(super) async fn remote_call(
        &mut self,
        aa: &Address,
        max_complexity: Option<u32>,
        getter: &str,
        args: Vec<Value>,
    ) -> EvalResult {
        let Some((def, params)) = self.resolve_definition(aa).await? else {
            return fail(format!("{aa} is not an AA"));
        };
        let Some(getters) = def.getters else {
            return fail(format!("AA {aa} has no getters"));
        };
        let costs = getters::getter_costs(self.ledger, self.config, aa, self.state.context.mci).await?;
        let Some(cost) = costs.get(&(aa.clone(), getter.to_string())) else {
            return fail(format!("no getter {getter} on AA {aa}"));
        };
        if let Some(max) = max_complexity {
            if cost.complexity > max {
                return fail(format!("getter {getter} complexity {} exceeds declared {max}", cost.complexity));
            }
        }
        debug!(aa = %aa, getter, "remote getter call");

        let mut inv = Invocation::new(aa.clone(), self.inv.trigger.clone(), params);
        let mode = EvalMode { is_getter: true, state_var_assignment_allowed: false };
        let mut callee = Evaluator::new(self.ledger, self.config, &mut *self.state, &mut inv, mode);
        callee.evaluate(&getters).await?;
        let Some(closure) = callee.scope.function(getter) else {
            return fail(format!("no getter {getter} on AA {aa}"));
        };
        callee.call_closure(&closure, args).await
    }
}
