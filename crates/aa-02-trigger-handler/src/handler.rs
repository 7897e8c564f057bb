//! # Trigger Handler
//!
//! Runs one primary trigger and the cascade of secondary triggers it causes.
//!
//! ## Invocation state machine
//!
//! ```text
//! resolve definition ─► admit ─► credit funds ─► getters, init, messages
//!        ─► compose unit ─► state message ─► storage check ─► response
//!        ─► secondary triggers (sorted by recipient)
//! ```
//!
//! Every step may bounce. A bounce anywhere in the cascade discards the
//! cascade state, rolls the ledger back to the savepoint taken before the
//! primary invocation and records a single bounced response for the primary
//! AA, refunding what it received minus the bounce fees.

use crate::domain::accounting::{balance_delta, bounce_refunds, storage_size_delta, updated_state_vars};
use crate::domain::{
    compose_unit, parse_messages, Funds, Issuance, PaymentRequest, RequestedOutput, ResponseMessage, UnitHeader,
};
use crate::errors::{Failure, HandlerError};
use crate::ports::outbound::AaLedger;
use aa_01_formula::config::AaConfig;
use aa_01_formula::domain::{
    AaDefinition, AaDefinitionKind, AaResponse, ChainContext, ResponseBody, Trigger, ValidationState, Value,
};
use aa_01_formula::evaluator::{EvalMode, Evaluator, Invocation};
use aa_01_formula::ports::outbound::LedgerReader;
use futures::future::{BoxFuture, FutureExt};
use shared_types::{Address, Amount, Asset, Mci, Unit, UnitHash};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, debug_span, info, warn, Instrument};

/// Savepoint guarding a whole cascade.
pub const CASCADE_SAVEPOINT: &str = "aa_cascade";

/// Outcome of a primary trigger.
#[derive(Debug, Clone, Default)]
pub struct CascadeResult {
    /// Responses in invocation order, primary first.
    pub responses: Vec<AaResponse>,
    /// Composed response units, oldest first.
    pub units: Vec<Unit>,
}

impl CascadeResult {
    /// Whether the primary invocation bounced.
    #[must_use]
    pub fn bounced(&self) -> bool {
        self.responses.first().is_some_and(|r| r.bounced)
    }
}

struct Resolved {
    definition: AaDefinition,
    params: Value,
}

/// Executes triggers against an [`AaLedger`] inside an open transaction.
pub struct TriggerHandler<'a, L: AaLedger + ?Sized> {
    ledger: &'a L,
    config: &'a AaConfig,
}

impl<'a, L: AaLedger + ?Sized> TriggerHandler<'a, L> {
    /// Handler over `ledger`. The caller owns the transaction.
    pub fn new(ledger: &'a L, config: &'a AaConfig) -> Self {
        Self { ledger, config }
    }

    /// Runs `trigger` against `aa` and everything it cascades into, then
    /// persists the result.
    ///
    /// # Errors
    ///
    /// Ledger failures and triggers addressed to something that is not an
    /// AA. Bounces are returned as responses, not errors.
    pub async fn handle_primary(
        &self,
        context: ChainContext,
        trigger: Trigger,
        aa: &Address,
    ) -> Result<CascadeResult, HandlerError> {
        let mut state = ValidationState::new(context);
        let snapshot = state.clone();

        self.ledger.savepoint(CASCADE_SAVEPOINT).await?;
        match self.invoke(&mut state, trigger.clone(), aa.clone(), true).await {
            Ok(()) => {
                self.ledger.release(CASCADE_SAVEPOINT).await?;
                self.finish(state).await
            }
            Err(Failure::Bounce(reason)) => {
                info!(aa = %aa, reason = %reason, "primary trigger bounced");
                self.ledger.rollback_to(CASCADE_SAVEPOINT).await?;
                self.ledger.release(CASCADE_SAVEPOINT).await?;
                self.bounce(snapshot, &trigger, aa, reason).await
            }
            Err(Failure::Fatal(e)) => {
                self.ledger.rollback_to(CASCADE_SAVEPOINT).await?;
                self.ledger.release(CASCADE_SAVEPOINT).await?;
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Definitions and balances
    // -------------------------------------------------------------------------

    async fn resolve(&self, aa: &Address, mci: Mci) -> Result<Option<Resolved>, HandlerError> {
        let Some(record) = self.ledger.read_aa_definition(aa).await? else {
            return Ok(None);
        };
        if record.mci > mci {
            return Ok(None);
        }
        let invalid = |reason: String| HandlerError::InvalidDefinition { address: aa.clone(), reason };
        match record.definition {
            AaDefinitionKind::Plain(definition) => Ok(Some(Resolved { definition, params: empty_params()? })),
            AaDefinitionKind::Parameterized { base_aa, params } => {
                let base = self
                    .ledger
                    .read_aa_definition(&base_aa)
                    .await?
                    .ok_or_else(|| invalid(format!("base AA {base_aa} not found")))?;
                let AaDefinitionKind::Plain(definition) = base.definition else {
                    return Err(invalid(format!("base AA {base_aa} is parameterized")));
                };
                let json = serde_json::Value::Object(params.into_iter().collect());
                let params = Value::from_json(&json).map_err(|e| invalid(e.to_string()))?;
                Ok(Some(Resolved { definition, params }))
            }
        }
    }

    async fn balance(&self, state: &mut ValidationState, aa: &Address, asset: &Asset) -> Result<Amount, HandlerError> {
        if let Some(amount) = state.balances.get(aa).and_then(|b| b.get(asset)) {
            return Ok(*amount);
        }
        let amount = self.ledger.read_balance(aa, asset).await?;
        state.balances.entry(aa.clone()).or_default().insert(asset.clone(), amount);
        Ok(amount)
    }

    async fn add_balances(
        &self,
        state: &mut ValidationState,
        aa: &Address,
        delta: &BTreeMap<Asset, Amount>,
    ) -> Result<(), HandlerError> {
        for (asset, amount) in delta {
            let current = self.balance(state, aa, asset).await?;
            state.balances.entry(aa.clone()).or_default().insert(asset.clone(), current + amount);
        }
        Ok(())
    }

    async fn storage_size(&self, state: &mut ValidationState, aa: &Address) -> Result<i64, HandlerError> {
        if let Some(size) = state.storage_sizes.get(aa) {
            return Ok(*size);
        }
        let size = self.ledger.read_storage_size(aa).await?;
        state.storage_sizes.insert(aa.clone(), size);
        Ok(size)
    }

    // -------------------------------------------------------------------------
    // Invocation
    // -------------------------------------------------------------------------

    fn invoke<'b>(
        &'b self,
        state: &'b mut ValidationState,
        trigger: Trigger,
        aa: Address,
        primary: bool,
    ) -> BoxFuture<'b, Result<(), Failure>> {
        let span = debug_span!("aa_invocation", aa = %aa, trigger_unit = %trigger.unit, primary);
        async move {
            let mci = state.context.mci;
            let Some(resolved) = self.resolve(&aa, mci).await? else {
                if primary {
                    return Err(HandlerError::NotAnAa(aa).into());
                }
                return Ok(());
            };

            if state.number_of_responses >= self.config.max_responses_per_primary_trigger {
                return Err(Failure::Bounce("max number of responses per trigger exceeded".into()));
            }
            if primary {
                self.check_bounce_fees(&resolved.definition, &trigger)?;
            }

            self.add_balances(state, &aa, &trigger.outputs).await?;
            self.run(state, trigger, aa, resolved).await
        }
        .instrument(span)
        .boxed()
    }

    fn check_bounce_fees(&self, definition: &AaDefinition, trigger: &Trigger) -> Result<(), Failure> {
        let mut fees = definition.bounce_fees.clone().unwrap_or_default();
        fees.entry(Asset::base()).or_insert(self.config.min_bytes_bounce_fee);
        for (asset, fee) in &fees {
            if trigger.amount(asset) < *fee {
                return Err(Failure::Bounce(format!(
                    "received bytes are not enough to cover bounce fees: {asset} {} < {fee}",
                    trigger.amount(asset)
                )));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        state: &mut ValidationState,
        trigger: Trigger,
        aa: Address,
        resolved: Resolved,
    ) -> Result<(), Failure> {
        let Resolved { definition, params } = resolved;
        state.begin_invocation(&aa);
        let mut inv = Invocation::new(aa.clone(), trigger.clone(), params);

        let (substitution, scope) = {
            let mut ev = Evaluator::new(self.ledger, self.config, state, &mut inv, EvalMode::default());
            if let Some(getters) = &definition.getters {
                ev.evaluate(getters).await?;
            }
            if let Some(init) = &definition.init {
                ev.evaluate(init).await?;
            }
            let substitution = ev.substitute_messages(&definition.messages).await?;
            (substitution, ev.into_scope())
        };

        let parsed = parse_messages(&substitution.messages)?;
        let mut response_unit = None;
        if !parsed.messages.is_empty() {
            let unit = self.emit(state, &aa, &trigger.unit, &parsed.messages).await?;
            response_unit = Some(unit);
        }

        if let Some(statements) = &substitution.state {
            inv.response_unit = response_unit.as_ref().map(|u: &Unit| u.unit.clone());
            let mode = EvalMode { is_getter: false, state_var_assignment_allowed: true };
            let mut ev = Evaluator::new(self.ledger, self.config, state, &mut inv, mode).with_scope(scope);
            ev.evaluate(statements).await?;
        }

        let delta = state.state_vars.get(&aa).map_or(0, storage_size_delta);
        let size = self.storage_size(state, &aa).await? + delta;
        state.storage_sizes.insert(aa.clone(), size);
        if state.context.mci >= self.config.activation.storage_size_mci {
            let bytes = self.balance(state, &aa, &Asset::base()).await?;
            if bytes < size {
                return Err(Failure::Bounce(format!("byte balance {bytes} would drop below storage size {size}")));
            }
        }

        let info = (response_unit.is_none() && parsed.dropped).then(|| "no messages after filtering".to_string());
        let response_vars = inv.response_vars.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        state.responses.push(AaResponse {
            mci: state.context.mci,
            trigger_address: trigger.address.clone(),
            trigger_unit: trigger.unit.clone(),
            trigger_initial_unit: trigger.initial_unit.clone(),
            aa_address: aa.clone(),
            bounced: false,
            response_unit: response_unit.as_ref().map(|u| u.unit.clone()),
            response: ResponseBody {
                error: None,
                info,
                response_vars,
                logs: std::mem::take(&mut inv.logs),
                updated_state_vars: None,
            },
            balances: BTreeMap::new(),
        });
        debug!(responses = state.responses.len(), "invocation finished");

        let Some(unit) = response_unit else {
            return Ok(());
        };
        for recipient in unit.output_addresses().into_iter().filter(|a| a != &aa) {
            let is_aa = self
                .ledger
                .read_aa_definition(&recipient)
                .await?
                .is_some_and(|r| r.mci <= state.context.mci);
            if !is_aa {
                continue;
            }
            let Some(secondary) = Trigger::secondary(&trigger, &unit, &recipient) else {
                continue;
            };
            self.invoke(state, secondary, recipient, false).await.map_err(|f| match f {
                Failure::Bounce(reason) => Failure::Bounce(format!("one of secondary AAs bounced with error: {reason}")),
                fatal => fatal,
            })?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Response units
    // -------------------------------------------------------------------------

    async fn funds(&self, aa: &Address, messages: &[ResponseMessage], mci: Mci) -> Result<Funds, HandlerError> {
        let mut assets: BTreeSet<Asset> = messages
            .iter()
            .filter_map(|m| match m {
                ResponseMessage::Payment(p) => Some(p.asset.clone()),
                ResponseMessage::Other(_) => None,
            })
            .collect();
        assets.insert(Asset::base());

        let mut funds = Funds::default();
        for asset in assets {
            let candidates = self.ledger.read_spendable_outputs(aa, &asset, mci).await?;
            funds.candidates.insert(asset.clone(), candidates);
            if asset.is_base() {
                continue;
            }
            let Some(info) = self.ledger.read_asset(&asset).await? else {
                continue;
            };
            if &info.definer_address != aa || !info.definition.issued_by_definer_only || info.mci > mci {
                continue;
            }
            let max_serial = self.ledger.read_max_issue_serial(&asset).await?;
            let issuance = match info.definition.cap {
                Some(cap) => Issuance::Capped { cap, issued: max_serial.is_some() },
                None => Issuance::Uncapped { next_serial: max_serial.map_or(1, |s| s + 1) },
            };
            funds.issuance.insert(asset, issuance);
        }
        Ok(funds)
    }

    /// Composes, validates and stores a response unit, then books it.
    async fn emit(
        &self,
        state: &mut ValidationState,
        aa: &Address,
        trigger_unit: &UnitHash,
        messages: &[ResponseMessage],
    ) -> Result<Unit, Failure> {
        let ctx = state.context.clone();
        let previous = state.response_units.last().map_or(trigger_unit, |u| &u.unit);
        let header = UnitHeader::new(aa.clone(), &ctx.mc_unit, previous, ctx.last_ball_unit.clone(), ctx.timestamp);
        let funds = self.funds(aa, messages, ctx.mci).await?;
        let composed = compose_unit(&header, messages, &funds)?;
        self.ledger.validate_unit(&composed.unit).await?;

        self.add_balances(state, aa, &balance_delta(&composed, aa)).await?;
        self.ledger.save_unit(&composed.unit, None).await?;
        state.response_units.push(composed.unit.clone());
        state.number_of_responses += 1;
        debug!(unit = %composed.unit.unit, fees = composed.unit.total_fees(), "response unit composed");
        Ok(composed.unit)
    }

    // -------------------------------------------------------------------------
    // Outcomes
    // -------------------------------------------------------------------------

    async fn bounce(
        &self,
        mut state: ValidationState,
        trigger: &Trigger,
        aa: &Address,
        reason: String,
    ) -> Result<CascadeResult, HandlerError> {
        let mci = state.context.mci;
        let resolved = self.resolve(aa, mci).await?.ok_or_else(|| HandlerError::NotAnAa(aa.clone()))?;
        self.add_balances(&mut state, aa, &trigger.outputs).await?;

        let refunds = bounce_refunds(
            &trigger.outputs,
            resolved.definition.bounce_fees.as_ref(),
            self.config.min_bytes_bounce_fee,
        );
        let mut response_unit = None;
        if !refunds.is_empty() {
            let messages: Vec<ResponseMessage> = refunds
                .iter()
                .map(|(asset, amount)| {
                    ResponseMessage::Payment(PaymentRequest {
                        asset: asset.clone(),
                        outputs: vec![RequestedOutput { address: trigger.address.clone(), amount: Some(*amount) }],
                    })
                })
                .collect();
            match self.emit(&mut state, aa, &trigger.unit, &messages).await {
                Ok(unit) => response_unit = Some(unit.unit),
                Err(Failure::Bounce(why)) => warn!(aa = %aa, reason = %why, "bounce refund not sent"),
                Err(Failure::Fatal(e)) => return Err(e),
            }
        }

        let balances = state.balances.get(aa).cloned().unwrap_or_default();
        for (asset, amount) in &balances {
            self.ledger.write_balance(aa, asset, *amount).await?;
        }
        let response = AaResponse {
            mci,
            trigger_address: trigger.address.clone(),
            trigger_unit: trigger.unit.clone(),
            trigger_initial_unit: trigger.initial_unit.clone(),
            aa_address: aa.clone(),
            bounced: true,
            response_unit,
            response: ResponseBody { error: Some(reason), ..ResponseBody::default() },
            balances,
        };
        self.ledger.save_response(&response).await?;
        Ok(CascadeResult { responses: vec![response], units: state.response_units })
    }

    async fn finish(&self, state: ValidationState) -> Result<CascadeResult, HandlerError> {
        let ValidationState { balances, state_vars, storage_sizes, mut responses, response_units, .. } = state;
        let updated = updated_state_vars(&state_vars);

        for (address, vars) in &state_vars {
            for (name, entry) in vars.iter().filter(|(_, e)| e.updated) {
                self.ledger.write_state_var(address, name, entry.value.to_stored().as_ref()).await?;
            }
        }
        for (address, size) in &storage_sizes {
            self.ledger.write_storage_size(address, *size).await?;
        }
        for (address, amounts) in &balances {
            for (asset, amount) in amounts {
                self.ledger.write_balance(address, asset, *amount).await?;
            }
        }

        for response in &mut responses {
            response.balances = balances.get(&response.aa_address).cloned().unwrap_or_default();
        }
        if let Some(first) = responses.first_mut() {
            if !updated.is_empty() {
                first.response.updated_state_vars = Some(updated);
            }
        }
        for response in &responses {
            self.ledger.save_response(response).await?;
        }
        Ok(CascadeResult { responses, units: response_units })
    }
}

fn empty_params() -> Result<Value, HandlerError> {
    Value::from_json(&serde_json::json!({}))
        .map_err(|e| HandlerError::InvariantViolation(format!("empty params: {e}")))
}
