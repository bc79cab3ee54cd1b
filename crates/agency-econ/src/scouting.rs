//! Weighted scouting draws.
//!
//! The caller owns the random source, so a seeded `ChaCha8Rng` reproduces a
//! draw exactly.

use agency_core::{Archetype, Rarity, RarityWeight, ScoutingPolicy};
use rand::Rng;

/// Roll a rarity tier from the weighted table.
///
/// Zero-weight tiers are never drawn. An empty or all-zero table yields the
/// most common tier.
pub fn roll_rarity<R: Rng + ?Sized>(weights: &[RarityWeight], rng: &mut R) -> Rarity {
    let total: u64 = weights.iter().map(|w| u64::from(w.weight)).sum();
    if total == 0 {
        return Rarity::default();
    }
    let roll = rng.gen_range(0..total);
    let mut acc = 0u64;
    for w in weights {
        acc += u64::from(w.weight);
        if roll < acc {
            return w.rarity;
        }
    }
    weights.last().map(|w| w.rarity).unwrap_or_default()
}

/// Pick uniformly among candidates of `rarity`, or from the whole pool when
/// the tier has none. `None` only for an empty pool.
pub fn pick_candidate<'a, R: Rng + ?Sized>(
    pool: &'a [Archetype],
    rarity: Rarity,
    rng: &mut R,
) -> Option<&'a Archetype> {
    let tier: Vec<&Archetype> = pool.iter().filter(|a| a.rarity == rarity).collect();
    if tier.is_empty() {
        if pool.is_empty() {
            return None;
        }
        return pool.get(rng.gen_range(0..pool.len()));
    }
    tier.get(rng.gen_range(0..tier.len())).copied()
}

/// Roll a tier and pick a candidate in one step.
pub fn draw<'a, R: Rng + ?Sized>(
    policy: &ScoutingPolicy,
    pool: &'a [Archetype],
    rng: &mut R,
) -> Option<&'a Archetype> {
    if pool.is_empty() {
        return None;
    }
    let rarity = roll_rarity(&policy.rarity_weights, rng);
    pick_candidate(pool, rarity, rng)
}
