//! Economy tuning shared by every reconciliation pass.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{validate_archetype, Archetype, Rarity, ValidationError};

/// Immutable rates and growth constants.
///
/// Every reconciliation is a pure function of a policy plus entity state, so a
/// policy is passed explicitly to the automaton, ladder and planner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomyPolicy {
    /// Seconds of active time needed to lose 1% stamina (> 0).
    pub depletion_seconds_per_percent: Decimal,
    /// Seconds of rest needed to regain 1% stamina (> 0).
    pub regen_seconds_per_percent: Decimal,
    /// Fans gained per point of popularity per active second (>= 0).
    pub fan_gain_per_popularity_per_active_second: Decimal,
    /// Currency earned per fan per elapsed second (>= 0).
    pub passive_income_per_fan_per_second: Decimal,
    /// Fractional income increase applied on every level-up (>= 0).
    pub level_income_growth: Decimal,
    /// Experience needed to leave level 1 (> 0). Doubles every level.
    pub experience_base: Decimal,
    /// Highest reachable level (>= 1).
    pub level_cap: u32,
}

impl Default for EconomyPolicy {
    fn default() -> Self {
        Self {
            depletion_seconds_per_percent: Decimal::new(12, 0),
            regen_seconds_per_percent: Decimal::new(4, 0),
            fan_gain_per_popularity_per_active_second: Decimal::new(25, 3), // 0.025
            passive_income_per_fan_per_second: Decimal::new(25, 5),         // 0.00025
            level_income_growth: Decimal::new(5, 2),                        // 0.05
            experience_base: Decimal::new(10, 0),
            level_cap: 9999,
        }
    }
}

impl EconomyPolicy {
    /// Length of one full rest-to-work cycle: regenerate from 0 to 100, then
    /// deplete back to 0.
    pub fn full_cycle_seconds(&self) -> Decimal {
        (self.regen_seconds_per_percent + self.depletion_seconds_per_percent)
            * Decimal::ONE_HUNDRED
    }
}

/// Validate an economy policy before it is used for reconciliation.
pub fn validate_policy(p: &EconomyPolicy) -> Result<(), ValidationError> {
    if p.depletion_seconds_per_percent <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveRate("depletion_seconds_per_percent"));
    }
    if p.regen_seconds_per_percent <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveRate("regen_seconds_per_percent"));
    }
    if p.experience_base <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveRate("experience_base"));
    }
    let non_negative = [
        (
            "fan_gain_per_popularity_per_active_second",
            p.fan_gain_per_popularity_per_active_second,
        ),
        (
            "passive_income_per_fan_per_second",
            p.passive_income_per_fan_per_second,
        ),
        ("level_income_growth", p.level_income_growth),
    ];
    for (name, value) in non_negative {
        if value < Decimal::ZERO {
            return Err(ValidationError::NegativeRate(name));
        }
    }
    if p.level_cap == 0 {
        return Err(ValidationError::InvalidLevelCap(p.level_cap));
    }
    Ok(())
}

/// Relative chance of drawing one rarity tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RarityWeight {
    pub rarity: Rarity,
    pub weight: u32,
}

/// Price and odds of scouting a new worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutingPolicy {
    /// Currency charged per scout.
    pub cost: Decimal,
    /// Fraction of `cost` refunded when the drawn worker is already owned.
    pub duplicate_cashback: Decimal,
    pub rarity_weights: Vec<RarityWeight>,
}

impl Default for ScoutingPolicy {
    fn default() -> Self {
        let weights = [
            (Rarity::N, 50),
            (Rarity::R, 25),
            (Rarity::SR, 15),
            (Rarity::SSR, 8),
            (Rarity::UR, 2),
        ];
        Self {
            cost: Decimal::new(500, 0),
            duplicate_cashback: Decimal::new(5, 1),
            rarity_weights: weights
                .into_iter()
                .map(|(rarity, weight)| RarityWeight { rarity, weight })
                .collect(),
        }
    }
}

impl ScoutingPolicy {
    /// Refund for a duplicate draw, rounded to whole currency.
    pub fn cashback(&self) -> Decimal {
        (self.cost * self.duplicate_cashback).round()
    }
}

/// One-time welcome package: currency plus a first worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarterGrant {
    pub bonus: Decimal,
    pub worker: Archetype,
}

impl Default for StarterGrant {
    fn default() -> Self {
        Self {
            bonus: Decimal::new(1000, 0),
            worker: Archetype {
                name: "Aya".to_string(),
                rarity: Rarity::N,
                income: Decimal::new(5, 0),
                popularity: Decimal::new(100, 0),
            },
        }
    }
}

/// Validate scouting odds and the starter package.
pub fn validate_scouting(
    scouting: &ScoutingPolicy,
    starter: &StarterGrant,
) -> Result<(), ValidationError> {
    if scouting.cost < Decimal::ZERO || starter.bonus < Decimal::ZERO {
        return Err(ValidationError::NegativeMoney);
    }
    let c = scouting.duplicate_cashback;
    if c < Decimal::ZERO || c > Decimal::ONE {
        return Err(ValidationError::InvalidCashback(c));
    }
    if scouting.rarity_weights.iter().all(|w| w.weight == 0) {
        return Err(ValidationError::EmptyRarityWeights);
    }
    validate_archetype(&starter.worker)
}
