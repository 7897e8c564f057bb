//! # Autonomous Agents Engine Benchmarks
//!
//! | Area | Operation | Target |
//! |------|-----------|--------|
//! | aa-01 Formula | Definition validation | < 1ms |
//! | aa-02 Trigger Handler | Coin selection over 1000 outputs | < 1ms |
//! | aa-02 Trigger Handler | Payment trigger end to end | < 5ms |

use aa_01_formula::config::AaConfig;
use aa_01_formula::domain::ast::AssignOp;
use aa_01_formula::domain::{AaDefinitionKind, Expr, Template};
use aa_01_formula::ports::outbound::NoGetters;
use aa_01_formula::validator::validate_aa_definition;
use aa_02_trigger_handler::domain::{select_coins, Issuance};
use aa_02_trigger_handler::ports::inbound::AaEngineApi;
use aa_tests::fixtures::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shared_types::{Asset, SpendableOutput, UnitHash};

// ============================================================================
// aa-01: Definition validation
// ============================================================================

fn bench_definition_validation(c: &mut Criterion) {
    let config = AaConfig::default();
    let state = Expr::statements(
        (0..50).map(|i| set_var(&format!("v{i}"), AssignOp::Add, received_bytes())).collect(),
    );
    let definition = AaDefinitionKind::Plain(messages(vec![
        payment(vec![(trigger_address(), Expr::num(1_000))]),
        Template::state_message(state),
    ]));

    c.bench_function("aa-01-validate-definition", |b| {
        b.iter(|| black_box(validate_aa_definition(&definition, 1, &config, &NoGetters).is_ok()))
    });
}

// ============================================================================
// aa-02: Coin selection
// ============================================================================

fn bench_coin_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("aa-02-coin-selection");
    let issuer = addr('A');
    for size in [10u32, 100, 1_000] {
        let candidates: Vec<SpendableOutput> = (0..size)
            .map(|i| SpendableOutput {
                unit: UnitHash::new(format!("{i:064x}")),
                message_index: 0,
                output_index: i,
                amount: 1_000 + i64::from(i),
                mci: Some(u64::from(i)),
                from_aa: false,
            })
            .collect();
        let target = i64::from(size) * 500;
        group.bench_with_input(BenchmarkId::from_parameter(size), &candidates, |b, candidates| {
            b.iter(|| black_box(select_coins(&Asset::base(), candidates, Some(target), Issuance::None, &issuer)))
        });
    }
    group.finish();
}

// ============================================================================
// aa-02: Full trigger
// ============================================================================

fn bench_payment_trigger(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let aa = addr('A');
    let definition = messages(vec![
        payment(vec![(trigger_address(), Expr::num(1_000))]),
        Template::state_message(Expr::statements(vec![set_var("count", AssignOp::Add, Expr::num(1))])),
    ]);

    c.bench_function("aa-02-payment-trigger", |b| {
        b.iter(|| {
            rt.block_on(async {
                let service = service(AaConfig::default());
                service.define_aa(plain(&aa, definition.clone())).await.expect("definition");
                service.ledger().add_trigger_unit(&paying('U', &aa, 50_000), 5);
                black_box(service.handle_aa_triggers().await.expect("trigger"))
            })
        })
    });
}

criterion_group!(benches, bench_definition_validation, bench_coin_selection, bench_payment_trigger);
criterion_main!(benches);
