//! # Ledger Invariants
//!
//! Consistency rules that must hold after any sequence of triggers:
//!
//! | Rule | Checked by |
//! |------|-----------|
//! | Cached balance equals unspent outputs | `check_balances()` |
//! | Storage counter equals stored variable sizes | `check_storage_sizes()` |
//! | Same ledger and trigger give the same units | two independent services |

#[cfg(test)]
mod tests {
    use crate::fixtures::*;
    use aa_01_formula::config::AaConfig;
    use aa_01_formula::domain::ast::AssignOp;
    use aa_01_formula::domain::{Expr, StoredKind, StoredValue, Template};
    use aa_01_formula::ports::outbound::LedgerReader;
    use aa_02_trigger_handler::errors::HandlerError;
    use aa_02_trigger_handler::ports::inbound::AaEngineApi;
    use aa_02_trigger_handler::ports::outbound::AaLedger;
    use aa_02_trigger_handler::adapters::InMemoryAaLedger;
    use aa_02_trigger_handler::service::AaService;
    use proptest::prelude::*;
    use shared_types::{Address, Amount, Asset};

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    /// Pays `amount` back to the sender and counts.
    fn refunder(amount: i64) -> aa_01_formula::domain::AaDefinition {
        messages(vec![
            payment(vec![(trigger_address(), Expr::num(amount))]),
            Template::state_message(Expr::statements(vec![set_var("count", AssignOp::Add, Expr::num(1))])),
        ])
    }

    /// Stores `name` from trigger data, or deletes it when the data says so.
    fn name_store() -> aa_01_formula::domain::AaDefinition {
        use aa_01_formula::domain::ast::TriggerField;
        let name = Expr::WithSelectors {
            expr: Box::new(Expr::Trigger { field: TriggerField::Data }),
            selectors: vec![Expr::str("name")],
        };
        let value = Expr::Otherwise { value: Box::new(name), fallback: Box::new(Expr::boolean(false)) };
        messages(vec![Template::state_message(Expr::statements(vec![set_var("name", AssignOp::Assign, value)]))])
    }

    async fn run_workload(service: &AaService<InMemoryAaLedger>, amounts: &[Amount]) {
        for (i, amount) in amounts.iter().enumerate() {
            let unit = paying_with_data('U', &addr('A'), *amount, None, i as u64);
            service.ledger().add_trigger_unit(&unit, 5 + i as u64);
        }
        service.handle_aa_triggers().await.unwrap();
    }

    // =============================================================================
    // CONSISTENCY SCANS
    // =============================================================================

    #[tokio::test]
    async fn test_scans_pass_after_mixed_workload() {
        let service = service(AaConfig::default());
        service.define_aa(plain(&addr('A'), refunder(3_000))).await.unwrap();
        run_workload(&service, &[50_000, 9_000, 120_000, 15_000]).await;

        let stats = service.stats().await;
        assert_eq!(stats.triggers_processed, 4);
        assert_eq!(stats.triggers_bounced, 1, "9000 bytes cannot cover the bounce fee");
        service.check_balances().await.unwrap();
        service.check_storage_sizes().await.unwrap();
        assert_eq!(service.ledger().read_state_var(&addr('A'), "count").await.unwrap().unwrap().text, "3");
    }

    #[tokio::test]
    async fn test_storage_size_follows_writes_and_deletes() {
        let service = service(AaConfig::default());
        let aa = addr('S');
        service.define_aa(plain(&aa, name_store())).await.unwrap();

        let store = paying_with_data('U', &aa, 20_000, Some(serde_json::json!({ "name": "alice" })), 1);
        service.ledger().add_trigger_unit(&store, 5);
        service.handle_aa_triggers().await.unwrap();
        assert_eq!(service.ledger().read_storage_size(&aa).await.unwrap(), ("name".len() + "alice".len()) as i64);
        service.check_storage_sizes().await.unwrap();

        let delete = paying_with_data('U', &aa, 20_000, Some(serde_json::json!({ "other": 1 })), 2);
        service.ledger().add_trigger_unit(&delete, 6);
        service.handle_aa_triggers().await.unwrap();
        assert!(service.ledger().read_state_var(&aa, "name").await.unwrap().is_none());
        assert_eq!(service.ledger().read_storage_size(&aa).await.unwrap(), 0);
        service.check_storage_sizes().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_balance_detected() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        service.define_aa(plain(&aa, refunder(3_000))).await.unwrap();
        run_workload(&service, &[50_000]).await;
        service.check_balances().await.unwrap();

        let cached = service.ledger().read_balance(&aa, &Asset::base()).await.unwrap();
        service.ledger().update(|d| d.set_balance(&aa, &Asset::base(), cached + 1));
        let err = service.check_balances().await.unwrap_err();
        assert!(err.is_invariant_violation());
        match err {
            HandlerError::BalanceMismatch { address, cached: c, outputs, .. } => {
                assert_eq!(address, aa);
                assert_eq!(c, outputs + 1);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn test_corrupted_storage_detected() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        service.define_aa(plain(&aa, counter())).await.unwrap();
        run_workload(&service, &[20_000]).await;
        service.check_storage_sizes().await.unwrap();

        service.ledger().update(|d| {
            d.state_vars.insert((aa.clone(), "extra".into()), StoredValue { kind: StoredKind::Number, text: "7".into() });
        });
        let err = service.check_storage_sizes().await.unwrap_err();
        assert!(matches!(err, HandlerError::StorageSizeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_balance_scan_waits_for_queue() {
        let service = service(AaConfig::default());
        let aa = addr('A');
        service.define_aa(plain(&aa, counter())).await.unwrap();
        service.ledger().add_trigger_unit(&paying('U', &aa, 20_000), 5);

        // the stable output is not yet credited
        assert_ne!(
            service.ledger().read_balance(&aa, &Asset::base()).await.unwrap(),
            service.ledger().read_unspent_totals(&aa).await.unwrap()[&Asset::base()]
        );
        service.check_balances().await.unwrap();
    }

    // =============================================================================
    // DETERMINISM
    // =============================================================================

    #[tokio::test]
    async fn test_identical_ledgers_compose_identical_units() {
        let mut runs = Vec::new();
        for _ in 0..2 {
            let service = service(AaConfig::default());
            let (a, b): (Address, Address) = (addr('A'), addr('B'));
            service.define_aa(plain(&b, counter())).await.unwrap();
            service
                .define_aa(plain(
                    &a,
                    messages(vec![payment(vec![
                        (Expr::str(b.as_str()), Expr::num(40_000)),
                        (trigger_address(), Expr::num(2_000)),
                    ])]),
                ))
                .await
                .unwrap();
            service.ledger().add_trigger_unit(&paying('U', &a, 100_000), 5);
            let events = service.handle_aa_triggers().await.unwrap();
            runs.push(events[0].units.clone());
        }
        assert_eq!(runs[0].len(), 1);
        assert_eq!(runs[0], runs[1]);
    }

    // =============================================================================
    // TELEMETRY
    // =============================================================================

    #[tokio::test]
    async fn test_trigger_metrics_exported() {
        aa_telemetry::metrics::register_metrics().unwrap();
        let before = aa_telemetry::metrics::TRIGGERS_TOTAL.get();
        let service = service(AaConfig::default());
        service.define_aa(plain(&addr('A'), counter())).await.unwrap();
        run_workload(&service, &[20_000]).await;

        assert!(aa_telemetry::metrics::TRIGGERS_TOTAL.get() > before);
        let text = aa_telemetry::metrics::gather_metrics().unwrap();
        assert!(text.contains("aa_triggers_total"));
    }

    // =============================================================================
    // PROPERTIES
    // =============================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_balances_consistent_after_any_workload(
            amounts in prop::collection::vec(1_000i64..300_000, 1..5),
            refund in 1i64..5_000,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let service = service(AaConfig::default());
                service.define_aa(plain(&addr('A'), refunder(refund))).await.unwrap();
                run_workload(&service, &amounts).await;

                service.check_balances().await.unwrap();
                service.check_storage_sizes().await.unwrap();
                assert_eq!(service.ledger().pending_count(), 0);
                assert_eq!(service.stats().await.triggers_processed, amounts.len() as u64);
            });
        }
    }
}
