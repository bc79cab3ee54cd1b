//! Closed-form stamina automaton.
//!
//! A worker alternates between two linear phases: draining stamina while
//! active and regenerating it while resting. Hitting 0 forces a rest, hitting
//! 100 forces a return to work, and both switches take zero time. Elapsed time
//! is consumed phase by phase; once a boundary has been reached, whole
//! rest/work cycles are skipped arithmetically so the cost is independent of
//! `dt`.

use agency_core::{Activity, EconomyPolicy, STAMINA_DP, STAMINA_MAX, STAMINA_MIN};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Result of advancing one worker's stamina over an elapsed window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaminaOutcome {
    /// Final stamina, rounded to [`STAMINA_DP`] places, in [0, 100].
    pub stamina: Decimal,
    /// Final engagement state.
    pub activity: Activity,
    /// Seconds spent active; the only time that accrues income, fans and XP.
    pub active_seconds: Decimal,
    /// Seconds spent resting. `active_seconds + rest_seconds == dt`.
    pub rest_seconds: Decimal,
}

/// Apply the instantaneous boundary switches.
fn settle(stamina: Decimal, activity: Activity) -> Activity {
    match activity {
        Activity::Active if stamina <= STAMINA_MIN => Activity::Resting,
        Activity::Resting if stamina >= STAMINA_MAX => Activity::Active,
        a => a,
    }
}

/// Advance stamina and activity by `dt` seconds.
///
/// Out-of-range stamina is clamped first and a negative `dt` is treated as 0.
pub fn advance(
    policy: &EconomyPolicy,
    stamina: Decimal,
    activity: Activity,
    dt: Decimal,
) -> StaminaOutcome {
    let drain = policy.depletion_seconds_per_percent;
    let regen = policy.regen_seconds_per_percent;
    let cycle = policy.full_cycle_seconds();

    let mut s = stamina.clamp(STAMINA_MIN, STAMINA_MAX);
    let mut a = activity;
    let mut remaining = dt.max(Decimal::ZERO);
    let mut active = Decimal::ZERO;
    let mut rest = Decimal::ZERO;
    let mut on_boundary = false;

    loop {
        a = settle(s, a);
        if remaining <= Decimal::ZERO {
            break;
        }
        if on_boundary && remaining >= cycle {
            // From either boundary a full cycle returns to the same state.
            let mut n = (remaining / cycle).floor();
            if n * cycle > remaining {
                n -= Decimal::ONE;
            }
            active += n * STAMINA_MAX * drain;
            rest += n * STAMINA_MAX * regen;
            remaining -= n * cycle;
            continue;
        }
        match a {
            Activity::Active => {
                let budget = s * drain;
                if remaining <= budget {
                    s = (s - remaining / drain).max(STAMINA_MIN);
                    active += remaining;
                    remaining = Decimal::ZERO;
                } else {
                    s = STAMINA_MIN;
                    active += budget;
                    remaining -= budget;
                    on_boundary = true;
                }
            }
            Activity::Resting => {
                let budget = (STAMINA_MAX - s) * regen;
                if remaining <= budget {
                    s = (s + remaining / regen).min(STAMINA_MAX);
                    rest += remaining;
                    remaining = Decimal::ZERO;
                } else {
                    s = STAMINA_MAX;
                    rest += budget;
                    remaining -= budget;
                    on_boundary = true;
                }
            }
        }
    }

    let stamina = s.round_dp(STAMINA_DP).clamp(STAMINA_MIN, STAMINA_MAX);
    StaminaOutcome {
        stamina,
        activity: settle(stamina, a),
        active_seconds: active,
        rest_seconds: rest,
    }
}
