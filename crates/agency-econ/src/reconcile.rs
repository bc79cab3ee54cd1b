//! Turning elapsed time into account and worker deltas.
//!
//! [`plan_reconciliation`] is the pure half of a tick: it takes a snapshot and
//! the current time and returns what must be written, without touching
//! storage.

use agency_core::{AccountSnapshot, EconomyPolicy, Worker, WorkerId, WorkerUpdate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ladder::{self, LadderContext, Progression};
use crate::stamina;
use crate::EconError;

/// What one worker earned over an elapsed window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAccrual {
    pub worker: WorkerId,
    /// Seconds spent active.
    pub active_seconds: Decimal,
    /// Seconds spent resting.
    pub rest_seconds: Decimal,
    /// Currency earned at the pre-level-up income rate.
    pub income_earned: Decimal,
    /// Fans gained.
    pub fans_gained: Decimal,
    /// Levels gained after adding the active seconds as experience.
    pub levels_gained: u32,
}

/// Summary of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// Seconds reconciled; 0 means nothing happened.
    pub elapsed_seconds: i64,
    /// Everything added to the balance, passive income included.
    pub income_gain: Decimal,
    /// Fan-driven share of `income_gain`.
    pub passive_gain: Decimal,
    /// Fans across the whole roster after accrual.
    pub total_fans: Decimal,
    /// Workers that gained at least one level, in roster order.
    pub leveled_up: Vec<WorkerId>,
}

impl ReconciliationResult {
    /// The zero-effect result.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.elapsed_seconds == 0
    }
}

/// Everything a reconciliation must commit atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationPlan {
    /// Watermark the snapshot was read at; the commit is guarded on it.
    pub expected_last_reconciled: i64,
    pub new_balance: Decimal,
    pub new_last_reconciled: i64,
    pub updates: Vec<WorkerUpdate>,
    pub accruals: Vec<WorkerAccrual>,
    pub result: ReconciliationResult,
}

fn mul(a: Decimal, b: Decimal, what: &'static str) -> Result<Decimal, EconError> {
    a.checked_mul(b).ok_or(EconError::Overflow(what))
}

fn add(a: Decimal, b: Decimal, what: &'static str) -> Result<Decimal, EconError> {
    a.checked_add(b).ok_or(EconError::Overflow(what))
}

/// Advance one worker by `dt` seconds in place.
///
/// Income for the window is earned at the rate the worker had when the window
/// started; level-ups reached during the window only affect later windows.
pub fn accrue_worker(
    policy: &EconomyPolicy,
    ctx: &LadderContext,
    worker: &mut Worker,
    dt: Decimal,
) -> Result<WorkerAccrual, EconError> {
    let out = stamina::advance(policy, worker.stamina, worker.activity, dt);
    worker.stamina = out.stamina;
    worker.activity = out.activity;

    let active = out.active_seconds;
    let income_earned = mul(worker.income, active, "income")?;
    // Fans never decrease, whatever the stored popularity says.
    let fans_gained = mul(
        mul(worker.popularity, policy.fan_gain_per_popularity_per_active_second, "fans")?,
        active,
        "fans",
    )?
    .max(Decimal::ZERO);
    worker.fans = add(worker.fans, fans_gained, "fans")?;

    let mut progression = Progression {
        level: worker.level,
        experience: std::mem::take(&mut worker.experience),
        income: worker.income,
    };
    let levels_gained = ladder::resolve(policy, ctx, &mut progression, &ladder::to_big(active))?;
    worker.level = progression.level;
    worker.experience = progression.experience;
    worker.income = progression.income;

    Ok(WorkerAccrual {
        worker: worker.id,
        active_seconds: active,
        rest_seconds: out.rest_seconds,
        income_earned,
        fans_gained,
        levels_gained,
    })
}

/// Compute the reconciliation of `snapshot` at time `now`.
///
/// Returns `None` when no time has elapsed (including a clock that moved
/// backward); such a pass must not write anything.
pub fn plan_reconciliation(
    policy: &EconomyPolicy,
    ctx: &LadderContext,
    snapshot: &AccountSnapshot,
    now: i64,
) -> Result<Option<ReconciliationPlan>, EconError> {
    let last = snapshot.account.last_reconciled;
    let elapsed = now.saturating_sub(last).max(0);
    if elapsed == 0 {
        return Ok(None);
    }
    let dt = Decimal::from(elapsed);

    let mut worker_income = Decimal::ZERO;
    let mut total_fans = Decimal::ZERO;
    let mut updates = Vec::with_capacity(snapshot.workers.len());
    let mut accruals = Vec::with_capacity(snapshot.workers.len());
    let mut leveled_up = Vec::new();

    for stored in &snapshot.workers {
        let mut worker = stored.clone();
        let accrual = accrue_worker(policy, ctx, &mut worker, dt)?;
        worker_income = add(worker_income, accrual.income_earned, "income")?;
        total_fans = add(total_fans, worker.fans, "fans")?;
        if accrual.levels_gained > 0 {
            leveled_up.push(worker.id);
        }
        updates.push(worker.to_update());
        accruals.push(accrual);
    }

    let passive_gain = mul(
        mul(total_fans, policy.passive_income_per_fan_per_second, "passive income")?,
        dt,
        "passive income",
    )?;
    let income_gain = add(worker_income, passive_gain, "income")?;
    let new_balance = add(snapshot.account.balance, income_gain, "balance")?;

    Ok(Some(ReconciliationPlan {
        expected_last_reconciled: last,
        new_balance,
        new_last_reconciled: now,
        updates,
        accruals,
        result: ReconciliationResult {
            elapsed_seconds: elapsed,
            income_gain,
            passive_gain,
            total_fans,
            leveled_up,
        },
    }))
}

/// Apply a plan to the snapshot it was computed from.
///
/// Storage backends use this to keep an in-memory copy in step with what they
/// committed.
pub fn apply_plan(snapshot: &mut AccountSnapshot, plan: &ReconciliationPlan) {
    snapshot.account.balance = plan.new_balance;
    snapshot.account.last_reconciled = plan.new_last_reconciled;
    for u in &plan.updates {
        if let Some(w) = snapshot.workers.iter_mut().find(|w| w.id == u.id) {
            w.stamina = u.stamina;
            w.activity = u.activity;
            w.fans = u.fans;
            w.experience = u.experience.clone();
            w.level = u.level;
            w.income = u.income;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_core::{Account, AccountId, Activity, Archetype, Rarity};
    use bigdecimal::BigDecimal;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn worker(id: i64, income: &str, popularity: &str) -> Worker {
        Worker::from_archetype(
            WorkerId(id),
            AccountId(1),
            &Archetype {
                name: format!("w{id}"),
                rarity: Rarity::N,
                income: dec(income),
                popularity: dec(popularity),
            },
        )
    }

    fn snapshot(workers: Vec<Worker>) -> AccountSnapshot {
        AccountSnapshot {
            account: Account {
                id: AccountId(1),
                balance: dec("100"),
                last_reconciled: 1_000,
                starter_claimed: false,
            },
            workers,
        }
    }

    #[test]
    fn zero_elapsed_is_noop() {
        let p = EconomyPolicy::default();
        let ctx = LadderContext::default();
        let snap = snapshot(vec![worker(1, "1", "1")]);
        assert_eq!(plan_reconciliation(&p, &ctx, &snap, 1_000).unwrap(), None);
        assert_eq!(plan_reconciliation(&p, &ctx, &snap, 900).unwrap(), None);
    }

    #[test]
    fn passive_income_uses_roster_fans() {
        let p = EconomyPolicy::default();
        let ctx = LadderContext::default();
        let mut a = worker(1, "0", "0");
        a.fans = dec("10");
        a.activity = Activity::Resting;
        a.stamina = dec("20");
        let mut b = worker(2, "0", "0");
        b.fans = dec("20");
        let snap = snapshot(vec![a, b]);
        let plan = plan_reconciliation(&p, &ctx, &snap, 1_100).unwrap().unwrap();
        assert_eq!(plan.result.total_fans, dec("30"));
        assert_eq!(plan.result.passive_gain, dec("0.75"));
        assert_eq!(plan.result.income_gain, dec("0.75"));
        assert_eq!(plan.new_balance, dec("100.75"));
        assert_eq!(plan.new_last_reconciled, 1_100);
        assert_eq!(plan.expected_last_reconciled, 1_000);
    }

    #[test]
    fn active_worker_earns_fans_income_and_levels() {
        let p = EconomyPolicy::default();
        let ctx = LadderContext::default();
        let snap = snapshot(vec![worker(9, "2", "4")]);
        let plan = plan_reconciliation(&p, &ctx, &snap, 1_025).unwrap().unwrap();
        let u = &plan.updates[0];
        // 25 active seconds: 25 xp pays requirement(1) = 10.
        assert_eq!(u.level, 2);
        assert_eq!(u.experience, BigDecimal::from(15));
        assert_eq!(u.income, dec("2.1"));
        assert_eq!(u.fans, dec("2.5"));
        assert_eq!(plan.accruals[0].income_earned, dec("50"));
        assert_eq!(plan.result.leveled_up, vec![WorkerId(9)]);
        // Worker income at the old rate plus passive on 2.5 fans for 25s.
        assert_eq!(plan.result.passive_gain, dec("0.015625"));
        assert_eq!(plan.result.income_gain, dec("50.015625"));
    }

    #[test]
    fn resting_worker_earns_nothing_itself() {
        let p = EconomyPolicy::default();
        let ctx = LadderContext::default();
        let mut w = worker(3, "5", "5");
        w.activity = Activity::Resting;
        w.stamina = dec("10");
        let snap = snapshot(vec![w]);
        let plan = plan_reconciliation(&p, &ctx, &snap, 1_200).unwrap().unwrap();
        assert_eq!(plan.accruals[0].active_seconds, Decimal::ZERO);
        assert_eq!(plan.result.income_gain, Decimal::ZERO);
        assert_eq!(plan.updates[0].stamina, dec("60"));
        assert!(plan.result.leveled_up.is_empty());
    }

    #[test]
    fn negative_popularity_never_lowers_fans() {
        let p = EconomyPolicy::default();
        let ctx = LadderContext::default();
        let mut w = worker(4, "0", "-5");
        w.fans = dec("10");
        let snap = snapshot(vec![w]);
        let plan = plan_reconciliation(&p, &ctx, &snap, 1_100).unwrap().unwrap();
        assert_eq!(plan.updates[0].fans, dec("10"));
        assert_eq!(plan.result.passive_gain, dec("0.25"));
        assert!(plan.new_balance >= snap.account.balance);
    }

    #[test]
    fn apply_plan_mirrors_updates() {
        let p = EconomyPolicy::default();
        let ctx = LadderContext::default();
        let mut snap = snapshot(vec![worker(1, "1", "1"), worker(2, "3", "0")]);
        let plan = plan_reconciliation(&p, &ctx, &snap, 4_000).unwrap().unwrap();
        apply_plan(&mut snap, &plan);
        assert_eq!(snap.account.last_reconciled, 4_000);
        assert_eq!(snap.account.balance, plan.new_balance);
        assert_eq!(snap.workers[1].to_update(), plan.updates[1]);
        assert_eq!(plan_reconciliation(&p, &ctx, &snap, 4_000).unwrap(), None);
    }

    proptest! {
        #[test]
        fn balance_never_decreases(
            dt in 1i64..5_000_000,
            income in 0i64..10_000,
            pop in 0i64..10_000,
        ) {
            let p = EconomyPolicy::default();
            let ctx = LadderContext::default();
            let snap = snapshot(vec![worker(1, &income.to_string(), &pop.to_string())]);
            let plan = plan_reconciliation(&p, &ctx, &snap, 1_000 + dt).unwrap().unwrap();
            prop_assert!(plan.new_balance >= snap.account.balance);
            prop_assert_eq!(plan.result.elapsed_seconds, dt);
            prop_assert!(plan.updates[0].fans >= Decimal::ZERO);
            let a = &plan.accruals[0];
            prop_assert_eq!(a.active_seconds + a.rest_seconds, Decimal::from(dt));
        }
    }
}
