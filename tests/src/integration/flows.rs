//! # Trigger Flows
//!
//! End-to-end scenarios: a trigger unit becomes stable, the service drains
//! the queue, and the resulting responses, units and ledger state are
//! checked against what the AA code asked for.
//!
//! ## Flows Tested:
//!
//! 1. **Bounce**: the trigger is refunded minus the bounce fee
//! 2. **Cascade**: a response unit paying another AA triggers it in the same transaction
//! 3. **Cascade bounce**: a secondary bounce undoes the whole cascade
//! 4. **Ledger lookups**: data feeds, trigger data, remote getters
//! 5. **Dry run**: estimates match the real run and leave nothing behind

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use aa_01_formula::config::AaConfig;
    use aa_01_formula::domain::ast::{AssignOp, TriggerField};
    use aa_01_formula::domain::{AaDefinition, AaDefinitionKind, AaDefinitionRecord, Expr, Template};
    use aa_01_formula::ports::outbound::LedgerReader;
    use aa_02_trigger_handler::errors::HandlerError;
    use aa_02_trigger_handler::ports::inbound::AaEngineApi;
    use serde_json::json;
    use shared_types::{Address, Asset, Message, Unit, UnitHash};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Pays 1 byte back, then bounces from the state message.
    fn always_bounces() -> AaDefinition {
        let state = Expr::statements(vec![set_var("touched", AssignOp::Assign, Expr::num(1)), bounce("insufficient")]);
        messages(vec![payment(vec![(trigger_address(), Expr::num(1))]), Template::state_message(state)])
    }

    /// Forwards 50000 bytes to `to` and counts.
    fn forwarder(to: &Address) -> AaDefinition {
        messages(vec![
            payment(vec![(Expr::str(to.as_str()), Expr::num(50_000))]),
            Template::state_message(Expr::statements(vec![set_var("count", AssignOp::Add, Expr::num(1))])),
        ])
    }

    /// Remembers who paid it and how much.
    fn recorder() -> AaDefinition {
        messages(vec![Template::state_message(Expr::statements(vec![
            set_var("from", AssignOp::Assign, trigger_address()),
            set_var("got", AssignOp::Assign, received_bytes()),
            set_var(
                "origin",
                AssignOp::Assign,
                Expr::Trigger { field: TriggerField::InitialAddress },
            ),
        ]))])
    }

    fn oracle_posting(oracle: &Address, feed: &str, value: serde_json::Value) -> Unit {
        let mut unit = paying('O', oracle, 1);
        unit.messages.push(Message::DataFeed([(feed.to_string(), value)].into_iter().collect()));
        unit.unit = shared_types::compute_unit_hash(&unit).unwrap();
        unit
    }

    // =============================================================================
    // BOUNCES
    // =============================================================================

    #[tokio::test]
    async fn test_bounce_refunds_trigger_minus_fee() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        service.define_aa(plain(&aa, always_bounces())).await.unwrap();
        let trigger = paying('U', &aa, 20_000);
        service.ledger().add_trigger_unit(&trigger, 5);

        let events = service.handle_aa_triggers().await.unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.bounced());
        assert_eq!(event.responses.len(), 1);
        assert_eq!(event.responses[0].response.error.as_deref(), Some("insufficient"));
        assert_eq!(event.responses[0].trigger_unit, trigger.unit);

        assert_eq!(event.units.len(), 1);
        assert_eq!(event.units[0].outputs_to(&addr('U'))[&Asset::base()], 10_000);
        assert!(service.ledger().read_state_var(&aa, "touched").await.unwrap().is_none());
        assert_eq!(service.stats().await.triggers_bounced, 1);
    }

    #[tokio::test]
    async fn test_declared_bounce_fee_is_kept() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        let mut definition = always_bounces();
        definition.bounce_fees = Some([(Asset::base(), 15_000)].into_iter().collect());
        service.define_aa(plain(&aa, definition)).await.unwrap();
        service.ledger().add_trigger_unit(&paying('U', &aa, 20_000), 5);

        let events = service.handle_aa_triggers().await.unwrap();
        let refund = &events[0].units[0];
        assert_eq!(refund.outputs_to(&addr('U'))[&Asset::base()], 5_000);
    }

    // =============================================================================
    // CASCADES
    // =============================================================================

    #[tokio::test]
    async fn test_counter_and_cascade() {
        let service = service(AaConfig::default());
        let (a, b) = (addr('A'), addr('B'));
        service.define_aa(plain(&b, recorder())).await.unwrap();
        service.define_aa(plain(&a, forwarder(&b))).await.unwrap();
        let trigger = paying('U', &a, 100_000);
        service.ledger().add_trigger_unit(&trigger, 5);

        let events = service.handle_aa_triggers().await.unwrap();
        let event = &events[0];
        assert!(!event.bounced(), "{:?}", event.responses[0].response.error);
        assert_eq!(event.responses.len(), 2);
        assert_eq!(event.units.len(), 1);

        let (primary, secondary) = (&event.responses[0], &event.responses[1]);
        assert_eq!(primary.aa_address, a);
        assert_eq!(secondary.aa_address, b);
        assert_eq!(secondary.trigger_address, a);
        assert_eq!(secondary.trigger_unit, event.units[0].unit);
        assert_eq!(secondary.trigger_initial_unit, trigger.unit);

        let ledger = service.ledger();
        assert_eq!(ledger.read_state_var(&a, "count").await.unwrap().unwrap().text, "1");
        assert_eq!(ledger.read_state_var(&b, "from").await.unwrap().unwrap().text, a.as_str());
        assert_eq!(ledger.read_state_var(&b, "got").await.unwrap().unwrap().text, "50000");
        assert_eq!(ledger.read_state_var(&b, "origin").await.unwrap().unwrap().text, addr('U').as_str());
        assert_eq!(ledger.read_balance(&b, &Asset::base()).await.unwrap(), 50_000);

        let fees = event.units[0].total_fees();
        assert_eq!(ledger.read_balance(&a, &Asset::base()).await.unwrap(), 100_000 - 50_000 - fees);
        service.check_balances().await.unwrap();
        service.check_storage_sizes().await.unwrap();
    }

    #[tokio::test]
    async fn test_secondary_bounce_undoes_cascade() {
        let service = service(AaConfig::default());
        let (a, b) = (addr('A'), addr('B'));
        let refuses = messages(vec![Template::state_message(Expr::statements(vec![bounce("nope")]))]);
        service.define_aa(plain(&b, refuses)).await.unwrap();
        service.define_aa(plain(&a, forwarder(&b))).await.unwrap();
        service.ledger().add_trigger_unit(&paying('U', &a, 100_000), 5);

        let events = service.handle_aa_triggers().await.unwrap();
        let event = &events[0];
        assert!(event.bounced());
        assert_eq!(event.responses.len(), 1);
        assert_eq!(
            event.responses[0].response.error.as_deref(),
            Some("one of secondary AAs bounced with error: nope")
        );

        let ledger = service.ledger();
        assert!(ledger.read_state_var(&a, "count").await.unwrap().is_none());
        assert_eq!(ledger.read_balance(&b, &Asset::base()).await.unwrap(), 0);
        assert_eq!(event.units.len(), 1);
        assert_eq!(event.units[0].outputs_to(&addr('U'))[&Asset::base()], 90_000);
        service.check_balances().await.unwrap();
    }

    // =============================================================================
    // LEDGER LOOKUPS
    // =============================================================================

    #[tokio::test]
    async fn test_missing_data_feed_bounces_until_posted() {
        let service = service(AaConfig::default());
        let (aa, oracle) = (addr('A'), addr('O'));
        let state = Expr::statements(vec![set_var("price", AssignOp::Assign, data_feed_above(&oracle, "BTC_USD", 100))]);
        service.define_aa(plain(&aa, messages(vec![Template::state_message(state)]))).await.unwrap();

        service.ledger().add_trigger_unit(&paying_with_data('U', &aa, 20_000, None, 1), 5);
        let events = service.handle_aa_triggers().await.unwrap();
        assert!(events[0].bounced());
        assert!(events[0].responses[0].response.error.as_deref().unwrap().contains("data feed BTC_USD not found"));

        service.ledger().seed_unit(&oracle_posting(&oracle, "BTC_USD", json!(42)), Some(6));
        service.ledger().add_trigger_unit(&paying_with_data('U', &aa, 20_000, None, 3), 7);
        assert!(service.handle_aa_triggers().await.unwrap()[0].bounced(), "42 is not above 100");

        service.ledger().seed_unit(&oracle_posting(&oracle, "BTC_USD", json!(142)), Some(8));
        service.ledger().add_trigger_unit(&paying_with_data('U', &aa, 20_000, None, 2), 9);
        let events = service.handle_aa_triggers().await.unwrap();
        assert!(!events[0].bounced(), "{:?}", events[0].responses[0].response.error);
        assert_eq!(service.ledger().read_state_var(&aa, "price").await.unwrap().unwrap().text, "142");
    }

    #[tokio::test]
    async fn test_trigger_data_reaches_formulas() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        let x = Expr::WithSelectors {
            expr: Box::new(Expr::Trigger { field: TriggerField::Data }),
            selectors: vec![Expr::str("x")],
        };
        let state = Expr::statements(vec![set_var("x", AssignOp::Assign, x)]);
        service.define_aa(plain(&aa, messages(vec![Template::state_message(state)]))).await.unwrap();
        service.ledger().add_trigger_unit(&paying_with_data('U', &aa, 20_000, Some(json!({ "x": "hello" })), 1), 5);

        service.handle_aa_triggers().await.unwrap();
        assert_eq!(service.ledger().read_state_var(&aa, "x").await.unwrap().unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_remote_getter_call() {
        let service = service(AaConfig::default());
        let (aa, library) = (addr('A'), addr('C'));
        let price = Expr::FuncDeclaration { args: vec![], body: Box::new(Expr::num(42)) };
        let mut lib_def = messages(vec![]);
        lib_def.getters = Some(Expr::statements(vec![Expr::assign("price", price)]));
        let info = service.define_aa(plain(&library, lib_def)).await.unwrap();
        assert!(info.getters.contains_key("price"));

        let call = |getter: &str| Expr::RemoteCall {
            aa: Box::new(Expr::str(library.as_str())),
            max_complexity: None,
            getter: getter.into(),
            args: vec![],
        };
        let unknown = messages(vec![Template::state_message(Expr::statements(vec![set_var(
            "p",
            AssignOp::Assign,
            call("volume"),
        )]))]);
        let err = service.define_aa(plain(&aa, unknown)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));

        let caller =
            messages(vec![Template::state_message(Expr::statements(vec![set_var("p", AssignOp::Assign, call("price"))]))]);
        service.define_aa(plain(&aa, caller)).await.unwrap();
        service.ledger().add_trigger_unit(&paying('U', &aa, 20_000), 5);
        let events = service.handle_aa_triggers().await.unwrap();
        assert!(!events[0].bounced(), "{:?}", events[0].responses[0].response.error);
        assert_eq!(service.ledger().read_state_var(&aa, "p").await.unwrap().unwrap().text, "42");
    }

    #[tokio::test]
    async fn test_parameterized_aa_runs_base_code() {
        let service = service(AaConfig::default());
        let (base, aa) = (addr('B'), addr('P'));
        service.define_aa(plain(&base, counter())).await.unwrap();
        let record = AaDefinitionRecord {
            address: aa.clone(),
            definition: AaDefinitionKind::Parameterized { base_aa: base.clone(), params: Default::default() },
            unit: hash('e'),
            mci: 2,
        };
        service.define_aa(record).await.unwrap();
        service.ledger().add_trigger_unit(&paying('U', &aa, 20_000), 5);

        service.handle_aa_triggers().await.unwrap();
        assert_eq!(service.ledger().read_state_var(&aa, "count").await.unwrap().unwrap().text, "1");
        assert!(service.ledger().read_state_var(&base, "count").await.unwrap().is_none());
    }

    // =============================================================================
    // DRY RUN
    // =============================================================================

    #[tokio::test]
    async fn test_dry_run_matches_real_run() {
        let service = service(AaConfig::default());
        let (a, b) = (addr('A'), addr('B'));
        service.define_aa(plain(&b, recorder())).await.unwrap();
        service.define_aa(plain(&a, forwarder(&b))).await.unwrap();
        let trigger = paying('U', &a, 100_000);

        let estimate = service.estimate_primary_aa_trigger(trigger.clone(), &a, 5).await.unwrap();
        assert_eq!(estimate.len(), 2);
        assert!(service.ledger().read_unit(&trigger.unit).await.unwrap().is_none());
        assert!(service.ledger().read_state_var(&a, "count").await.unwrap().is_none());
        assert!(service.ledger().responses().is_empty());

        service.ledger().add_trigger_unit(&trigger, 5);
        let events = service.handle_aa_triggers().await.unwrap();
        let real = &events[0].responses;
        assert_eq!(real.len(), estimate.len());
        for (r, e) in real.iter().zip(&estimate) {
            assert_eq!(r.response_unit, e.response_unit);
            assert_eq!(r.balances, e.balances);
            assert_eq!(r.response.error, e.response.error);
        }
    }

    #[tokio::test]
    async fn test_unknown_trigger_unit_keeps_queue() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        service.define_aa(plain(&aa, counter())).await.unwrap();
        let missing = UnitHash::new("f".repeat(64));
        service.ledger().enqueue(aa_02_trigger_handler::ports::outbound::PendingTrigger {
            mci: 5,
            unit: missing,
            aa_address: aa,
        });

        let err = service.handle_aa_triggers().await.unwrap_err();
        assert!(matches!(err, HandlerError::TriggerNotFound(_)));
        assert_eq!(service.ledger().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_trigger_keeps_earlier_events() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        service.define_aa(plain(&aa, counter())).await.unwrap();
        let good = paying('U', &aa, 20_000);
        service.ledger().add_trigger_unit(&good, 5);
        let missing = UnitHash::new("f".repeat(64));
        service.ledger().enqueue(aa_02_trigger_handler::ports::outbound::PendingTrigger {
            mci: 6,
            unit: missing.clone(),
            aa_address: aa.clone(),
        });

        let events = service.handle_aa_triggers().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger_unit, good.unit);
        assert_eq!(service.ledger().read_state_var(&aa, "count").await.unwrap().unwrap().text, "1");
        assert_eq!(service.ledger().pending_count(), 1);

        let err = service.handle_aa_triggers().await.unwrap_err();
        assert!(matches!(err, HandlerError::TriggerNotFound(unit) if unit == missing));
        assert_eq!(service.ledger().pending_count(), 1);
    }
}
