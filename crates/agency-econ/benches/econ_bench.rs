use agency_core::{
    Account, AccountId, AccountSnapshot, Activity, Archetype, EconomyPolicy, Rarity, Worker,
    WorkerId,
};
use agency_econ::{advance, plan_reconciliation, LadderContext};
use criterion::{criterion_group, criterion_main, Criterion};
use rust_decimal::Decimal;

fn bench_stamina(c: &mut Criterion) {
    let policy = EconomyPolicy::default();
    let month = Decimal::new(30 * 24 * 3600, 0);
    c.bench_function("stamina_month_gap", |b| {
        b.iter(|| advance(&policy, Decimal::new(73_125, 3), Activity::Resting, month))
    });
}

fn bench_reconcile(c: &mut Criterion) {
    let policy = EconomyPolicy::default();
    let ctx = LadderContext::for_policy(&policy);
    let workers = (0..50)
        .map(|i| {
            Worker::from_archetype(
                WorkerId(i),
                AccountId(1),
                &Archetype {
                    name: format!("worker-{i}"),
                    rarity: Rarity::N,
                    income: Decimal::new(5 + i, 1),
                    popularity: Decimal::new(10 + i, 0),
                },
            )
        })
        .collect();
    let snapshot = AccountSnapshot {
        account: Account {
            id: AccountId(1),
            balance: Decimal::ZERO,
            last_reconciled: 0,
            starter_claimed: false,
        },
        workers,
    };
    c.bench_function("reconcile_50_workers_one_year", |b| {
        b.iter(|| plan_reconciliation(&policy, &ctx, &snapshot, 365 * 24 * 3600))
    });
}

criterion_group!(benches, bench_stamina, bench_reconcile);
criterion_main!(benches);
