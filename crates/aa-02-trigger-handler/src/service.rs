//! # AA Trigger Handler Service
//!
//! Drives the trigger queue. Each queued trigger runs in its own ledger
//! transaction under a service-wide lock, so cascades never interleave and a
//! failed trigger leaves no trace.
//!
//! ## Entry points
//!
//! - `handle_aa_triggers` - drain the queue, one [`AaResponsesEvent`] per trigger
//! - `estimate_primary_aa_trigger` - dry run, always rolled back
//! - `define_aa` - validate and store a definition
//! - `check_balances` / `check_storage_sizes` - consistency scans

use crate::domain::accounting::stored_size;
use crate::errors::HandlerError;
use crate::events::AaResponsesEvent;
use crate::handler::{CascadeResult, TriggerHandler};
use crate::ports::inbound::AaEngineApi;
use crate::ports::outbound::{AaLedger, PendingTrigger};
use aa_01_formula::cache::FormulaCache;
use aa_01_formula::config::AaConfig;
use aa_01_formula::domain::{AaDefinitionKind, AaDefinitionRecord, AaResponse, Expr, Template, TemplateKey};
use aa_01_formula::errors::EvalError;
use aa_01_formula::evaluator::getters::{getter_costs, GetterCosts};
use aa_01_formula::ports::outbound::{FormulaParser, LedgerReader};
use aa_01_formula::validator::{validate_aa_definition, DefinitionInfo};
use async_trait::async_trait;
use chrono::Utc;
use shared_types::{Address, Mci, Unit};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Statistics for the trigger handler service.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    /// Primary triggers handled.
    pub triggers_processed: u64,
    /// Primary triggers that bounced.
    pub triggers_bounced: u64,
    /// Responses recorded, secondary ones included.
    pub responses_recorded: u64,
    /// Response units composed.
    pub units_composed: u64,
    /// Dry runs served.
    pub dry_runs: u64,
    /// Definitions accepted.
    pub definitions_accepted: u64,
    /// Definitions rejected.
    pub definitions_rejected: u64,
}

/// The trigger handler service.
pub struct AaService<L: AaLedger> {
    /// Engine limits and activation heights.
    config: AaConfig,
    /// Ledger adapter.
    ledger: Arc<L>,
    /// Formula source parser, if source text is accepted.
    parser: Option<Arc<dyn FormulaParser>>,
    /// Parsed formulas.
    formula_cache: FormulaCache,
    /// Serializes everything that writes the ledger.
    lock: Mutex<()>,
    /// Service statistics.
    stats: RwLock<ServiceStats>,
}

impl<L: AaLedger> AaService<L> {
    /// Create a new service.
    pub fn new(ledger: Arc<L>, config: AaConfig) -> Self {
        Self {
            formula_cache: FormulaCache::new(config.formula_cache_capacity),
            config,
            ledger,
            parser: None,
            lock: Mutex::new(()),
            stats: RwLock::new(ServiceStats::default()),
        }
    }

    /// Accept formula source text through `parser`.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn FormulaParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// The ledger adapter.
    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Engine configuration.
    pub fn config(&self) -> &AaConfig {
        &self.config
    }

    /// Get current service statistics.
    pub async fn stats(&self) -> ServiceStats {
        self.stats.read().await.clone()
    }

    /// Parses formula source, reusing earlier parses of the same text.
    ///
    /// # Errors
    ///
    /// `NoParser` without a configured parser, `Parse` on bad source.
    pub fn parse_formula(&self, source: &str) -> Result<Arc<Expr>, HandlerError> {
        let parser = self.parser.as_ref().ok_or(HandlerError::NoParser)?;
        self.formula_cache.get_or_parse(source, |s| parser.parse(s)).map_err(HandlerError::Parse)
    }

    /// Number of parsed formulas held by the cache.
    pub fn cached_formulas(&self) -> usize {
        self.formula_cache.len()
    }

    // -------------------------------------------------------------------------
    // Trigger processing
    // -------------------------------------------------------------------------

    #[instrument(skip(self, pending), fields(correlation_id = %correlation_id, aa = %pending.aa_address, mci = pending.mci))]
    async fn process_trigger(
        &self,
        correlation_id: Uuid,
        pending: &PendingTrigger,
    ) -> Result<CascadeResult, HandlerError> {
        self.ledger.begin().await?;
        match self.run_trigger(pending).await {
            Ok(result) => {
                self.ledger.commit().await?;
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "trigger processing failed, rolling back");
                if let Err(rollback) = self.ledger.rollback().await {
                    error!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn run_trigger(&self, pending: &PendingTrigger) -> Result<CascadeResult, HandlerError> {
        let stored = self
            .ledger
            .read_unit(&pending.unit)
            .await?
            .ok_or_else(|| HandlerError::TriggerNotFound(pending.unit.clone()))?;
        let trigger = aa_01_formula::domain::Trigger::from_unit(&stored.unit, &pending.aa_address)
            .ok_or_else(|| HandlerError::TriggerNotFound(pending.unit.clone()))?;
        let context = self.ledger.read_chain_context(pending.mci).await?;

        let handler = TriggerHandler::new(self.ledger.as_ref(), &self.config);
        let result = handler.handle_primary(context, trigger, &pending.aa_address).await?;
        self.ledger.remove_pending_trigger(pending).await?;
        Ok(result)
    }

    async fn dry_run(&self, trigger_unit: &Unit, aa: &Address, mci: Mci) -> Result<CascadeResult, HandlerError> {
        self.ledger.save_unit(trigger_unit, Some(mci)).await?;
        let trigger = aa_01_formula::domain::Trigger::from_unit(trigger_unit, aa)
            .ok_or_else(|| HandlerError::TriggerNotFound(trigger_unit.unit.clone()))?;
        let context = self.ledger.read_chain_context(mci).await?;
        TriggerHandler::new(self.ledger.as_ref(), &self.config).handle_primary(context, trigger, aa).await
    }

    async fn record(&self, result: &CascadeResult, elapsed: f64) {
        let mut stats = self.stats.write().await;
        stats.triggers_processed += 1;
        if result.bounced() {
            stats.triggers_bounced += 1;
        }
        stats.responses_recorded += result.responses.len() as u64;
        stats.units_composed += result.units.len() as u64;

        #[cfg(feature = "metrics")]
        aa_telemetry::metrics::record_trigger(result.bounced(), result.responses.len(), result.units.len(), elapsed);
        #[cfg(not(feature = "metrics"))]
        let _ = elapsed;
    }

    // -------------------------------------------------------------------------
    // Definitions
    // -------------------------------------------------------------------------

    async fn validate_definition(&self, record: &AaDefinitionRecord) -> Result<DefinitionInfo, HandlerError> {
        let mut costs = GetterCosts::new();
        for target in definition_remote_targets(&record.definition) {
            let Some(target) = Address::parse(&target) else { continue };
            if target == record.address {
                continue;
            }
            match getter_costs(self.ledger.as_ref(), &self.config, &target, record.mci).await {
                Ok(callee) => costs.extend(callee),
                Err(EvalError::Ledger(e)) => return Err(e.into()),
                Err(e) => debug!(aa = %target, error = %e, "callee getters not usable"),
            }
        }
        if let AaDefinitionKind::Parameterized { base_aa, .. } = &record.definition {
            let base = self.ledger.read_aa_definition(base_aa).await?;
            if !matches!(base, Some(AaDefinitionRecord { definition: AaDefinitionKind::Plain(_), .. })) {
                return Err(HandlerError::InvalidDefinition {
                    address: record.address.clone(),
                    reason: format!("base AA {base_aa} is not a plain AA"),
                });
            }
        }
        Ok(validate_aa_definition(&record.definition, record.mci, &self.config, &costs)?)
    }

    // -------------------------------------------------------------------------
    // Consistency scans
    // -------------------------------------------------------------------------

    fn violation(&self, check: &str, e: HandlerError) -> HandlerError {
        error!(check, error = %e, "invariant violation");
        #[cfg(feature = "metrics")]
        aa_telemetry::metrics::record_invariant_violation(check);
        e
    }
}

fn template_targets(template: &Template, out: &mut BTreeSet<String>) {
    match template {
        Template::Literal { .. } => {}
        Template::Formula { expr } => out.extend(expr.literal_remote_targets()),
        Template::Array { items } => items.iter().for_each(|t| template_targets(t, out)),
        Template::Object { cond, init, fields } => {
            for e in cond.iter().chain(init.iter()) {
                out.extend(e.literal_remote_targets());
            }
            for field in fields {
                if let TemplateKey::Formula(e) = &field.key {
                    out.extend(e.literal_remote_targets());
                }
                template_targets(&field.value, out);
            }
        }
        Template::Cases { cases } => {
            for case in cases {
                for e in case.cond.iter().chain(case.init.iter()) {
                    out.extend(e.literal_remote_targets());
                }
                template_targets(&case.body, out);
            }
        }
    }
}

/// Literal remote call targets anywhere in a definition.
fn definition_remote_targets(definition: &AaDefinitionKind) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if let AaDefinitionKind::Plain(def) = definition {
        for e in def.getters.iter().chain(def.init.iter()) {
            out.extend(e.literal_remote_targets());
        }
        template_targets(&def.messages, &mut out);
    }
    out
}

#[async_trait]
impl<L: AaLedger + 'static> AaEngineApi for AaService<L> {
    async fn handle_aa_triggers(&self) -> Result<Vec<AaResponsesEvent>, HandlerError> {
        let _guard = self.lock.lock().await;
        let pending = self.ledger.read_pending_triggers().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = pending.len(), "handling queued triggers");

        let mut events = Vec::with_capacity(pending.len());
        for trigger in &pending {
            let correlation_id = Uuid::new_v4();
            let started = Instant::now();
            let result = match self.process_trigger(correlation_id, trigger).await {
                Ok(result) => result,
                Err(e) if events.is_empty() => return Err(e),
                Err(e) => {
                    warn!(unit = %trigger.unit, error = %e, handled = events.len(), "stopping at failed trigger");
                    break;
                }
            };
            self.record(&result, started.elapsed().as_secs_f64()).await;

            info!(
                correlation_id = %correlation_id,
                aa = %trigger.aa_address,
                unit = %trigger.unit,
                responses = result.responses.len(),
                bounced = result.bounced(),
                "trigger handled"
            );
            events.push(AaResponsesEvent {
                correlation_id,
                mci: trigger.mci,
                trigger_unit: trigger.unit.clone(),
                aa_address: trigger.aa_address.clone(),
                responses: result.responses,
                units: result.units,
                processed_at: Utc::now(),
            });
        }
        Ok(events)
    }

    #[instrument(skip(self, trigger_unit), fields(unit = %trigger_unit.unit))]
    async fn estimate_primary_aa_trigger(
        &self,
        trigger_unit: Unit,
        aa: &Address,
        mci: Mci,
    ) -> Result<Vec<AaResponse>, HandlerError> {
        let _guard = self.lock.lock().await;
        self.ledger.begin().await?;
        let result = self.dry_run(&trigger_unit, aa, mci).await;
        self.ledger.rollback().await?;
        self.stats.write().await.dry_runs += 1;
        Ok(result?.responses)
    }

    #[instrument(skip(self, record), fields(aa = %record.address))]
    async fn define_aa(&self, record: AaDefinitionRecord) -> Result<DefinitionInfo, HandlerError> {
        let _guard = self.lock.lock().await;
        let info = match self.validate_definition(&record).await {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "definition rejected");
                self.stats.write().await.definitions_rejected += 1;
                #[cfg(feature = "metrics")]
                aa_telemetry::metrics::record_rejected_definition();
                return Err(e);
            }
        };

        self.ledger.begin().await?;
        if let Err(e) = self.ledger.save_aa_definition(&record).await {
            self.ledger.rollback().await?;
            return Err(e.into());
        }
        self.ledger.commit().await?;

        self.stats.write().await.definitions_accepted += 1;
        #[cfg(feature = "metrics")]
        aa_telemetry::metrics::observe_complexity(info.complexity.complexity);
        info!(complexity = info.complexity.complexity, ops = info.complexity.count_ops, "definition accepted");
        Ok(info)
    }

    async fn check_balances(&self) -> Result<(), HandlerError> {
        let _guard = self.lock.lock().await;
        if !self.ledger.read_pending_triggers().await?.is_empty() {
            debug!("triggers pending, balance check skipped");
            return Ok(());
        }
        for address in self.ledger.read_aa_addresses().await? {
            let cached = self.ledger.read_balances(&address).await?;
            let outputs = self.ledger.read_unspent_totals(&address).await?;
            let assets: BTreeSet<_> = cached.keys().chain(outputs.keys()).cloned().collect();
            for asset in assets {
                let cached_amount = cached.get(&asset).copied().unwrap_or(0);
                let output_amount = outputs.get(&asset).copied().unwrap_or(0);
                if cached_amount != output_amount {
                    return Err(self.violation(
                        "balances",
                        HandlerError::BalanceMismatch {
                            address,
                            asset,
                            cached: cached_amount,
                            outputs: output_amount,
                        },
                    ));
                }
            }
        }
        Ok(())
    }

    async fn check_storage_sizes(&self) -> Result<(), HandlerError> {
        let _guard = self.lock.lock().await;
        for address in self.ledger.read_aa_addresses().await? {
            let counter = self.ledger.read_storage_size(&address).await?;
            let actual: i64 =
                self.ledger.read_state_vars(&address).await?.iter().map(|(name, v)| stored_size(name, v)).sum();
            if counter != actual {
                return Err(self.violation("storage_sizes", HandlerError::StorageSizeMismatch { address, counter, actual }));
            }
        }
        Ok(())
    }
}
