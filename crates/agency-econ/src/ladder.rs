//! Experience requirements and multi-level advancement.
//!
//! `requirement(level) = experience_base * 2^(level - 1)` for levels below the
//! cap. Near a large cap that value runs to thousands of digits, so
//! requirements and experience are arbitrary-precision decimals.

use agency_core::EconomyPolicy;
use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use num_traits::{One, Zero};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::EconError;

/// Decimal places kept on income after a level-up.
pub const INCOME_DP: u32 = 5;

/// Precision settings for experience arithmetic.
///
/// Passed explicitly to every ladder call instead of living in a process-wide
/// context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LadderContext {
    precision: u64,
}

impl LadderContext {
    /// Context keeping up to `precision` significant digits.
    pub fn new(precision: u64) -> Self {
        Self {
            precision: precision.max(1),
        }
    }

    /// Enough digits to hold every requirement below the policy's cap exactly.
    ///
    /// `2^cap` has `cap * log10(2)` digits; the base and fractional seconds
    /// need a few dozen more.
    pub fn for_policy(policy: &EconomyPolicy) -> Self {
        let pow2_digits = u64::from(policy.level_cap) * 30_103 / 100_000 + 1;
        Self::new(pow2_digits + 64)
    }

    /// Maximum significant digits kept on experience.
    pub fn precision(&self) -> u64 {
        self.precision
    }

    fn fit(&self, value: BigDecimal) -> BigDecimal {
        if value.digits() > self.precision {
            value.with_prec(self.precision)
        } else {
            value
        }
    }
}

impl Default for LadderContext {
    fn default() -> Self {
        Self::for_policy(&EconomyPolicy::default())
    }
}

/// Exact conversion of a fixed-point decimal into an arbitrary-precision one.
pub fn to_big(value: Decimal) -> BigDecimal {
    BigDecimal::new(BigInt::from(value.mantissa()), i64::from(value.scale()))
}

/// Experience needed to leave `level`, or `None` once the cap is reached.
pub fn requirement(policy: &EconomyPolicy, level: u32) -> Option<BigDecimal> {
    if level >= policy.level_cap {
        return None;
    }
    let shift = level.max(1) - 1;
    let pow2 = BigInt::one() << shift as usize;
    Some(to_big(policy.experience_base) * BigDecimal::new(pow2, 0))
}

/// Distance to the next level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Level cap reached; experience no longer accrues.
    Capped,
    /// Experience still missing before the next level-up.
    Remaining(BigDecimal),
}

/// How far a worker at `level` with `experience` is from leveling.
pub fn progress_to_next(policy: &EconomyPolicy, level: u32, experience: &BigDecimal) -> Progress {
    match requirement(policy, level) {
        None => Progress::Capped,
        Some(req) if *experience >= req => Progress::Remaining(BigDecimal::zero()),
        Some(req) => Progress::Remaining(req - experience),
    }
}

/// Level, experience and income of one worker, as seen by the ladder.
#[derive(Clone, Debug, PartialEq)]
pub struct Progression {
    pub level: u32,
    pub experience: BigDecimal,
    pub income: Decimal,
}

/// Add `gain` experience and resolve every level-up it pays for.
///
/// Each level-up subtracts the current requirement, bumps the level and grows
/// income by `level_income_growth`. At the cap the leftover experience is
/// discarded. A level of 0 is read as level 1. Returns the number of levels
/// gained.
pub fn resolve(
    policy: &EconomyPolicy,
    ctx: &LadderContext,
    p: &mut Progression,
    gain: &BigDecimal,
) -> Result<u32, EconError> {
    let growth = Decimal::ONE + policy.level_income_growth;
    p.level = p.level.max(1);
    p.experience = ctx.fit(&p.experience + gain);

    let mut gained = 0u32;
    loop {
        let Some(req) = requirement(policy, p.level) else {
            p.experience = BigDecimal::zero();
            break;
        };
        if p.experience < req {
            break;
        }
        p.experience = ctx.fit(&p.experience - &req);
        p.level += 1;
        p.income = p
            .income
            .checked_mul(growth)
            .ok_or(EconError::Overflow("income"))?
            .round_dp(INCOME_DP);
        gained += 1;
    }
    Ok(gained)
}
