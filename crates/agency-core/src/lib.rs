#![deny(warnings)]

//! Core domain records and invariants for the idle agency economy.
//!
//! This crate defines the typed Account and Worker records that the
//! reconciliation engine reads and writes, the economy policy, and the
//! boundary checks that normalize records loaded from storage.

use bigdecimal::BigDecimal;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod policy;

pub use policy::{
    validate_policy, validate_scouting, EconomyPolicy, RarityWeight, ScoutingPolicy, StarterGrant,
};

/// Lowest representable stamina.
pub const STAMINA_MIN: Decimal = Decimal::ZERO;
/// Highest representable stamina.
pub const STAMINA_MAX: Decimal = Decimal::ONE_HUNDRED;
/// Decimal places kept on persisted stamina.
pub const STAMINA_DP: u32 = 3;

/// Unique identifier of a player account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub i64);

/// Unique identifier of a worker, global across accounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub i64);

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Engagement state of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Activity {
    /// Working: earns income, fans and experience while stamina drains.
    Active,
    /// Idle: stamina regenerates, nothing accrues.
    Resting,
}

impl Activity {
    /// Decode the persisted working flag.
    pub fn from_flag(working: bool) -> Self {
        if working {
            Activity::Active
        } else {
            Activity::Resting
        }
    }

    /// Encode as the persisted working flag.
    pub fn is_active(self) -> bool {
        matches!(self, Activity::Active)
    }

    /// The opposite state.
    pub fn toggled(self) -> Self {
        match self {
            Activity::Active => Activity::Resting,
            Activity::Resting => Activity::Active,
        }
    }
}

/// Scouting tier of an archetype, from most to least common.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Rarity {
    #[default]
    N,
    R,
    SR,
    SSR,
    UR,
}

impl Rarity {
    pub const ALL: [Rarity; 5] = [Rarity::N, Rarity::R, Rarity::SR, Rarity::SSR, Rarity::UR];

    pub fn code(self) -> &'static str {
        match self {
            Rarity::N => "N",
            Rarity::R => "R",
            Rarity::SR => "SR",
            Rarity::SSR => "SSR",
            Rarity::UR => "UR",
        }
    }
}

impl std::fmt::Display for Rarity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl std::str::FromStr for Rarity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        Rarity::ALL
            .into_iter()
            .find(|r| r.code() == code)
            .ok_or(ValidationError::UnknownRarity(s.to_string()))
    }
}

/// A player account: currency balance plus the reconciliation watermark.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account identity.
    pub id: AccountId,
    /// Currency balance (>= 0).
    pub balance: Decimal,
    /// Epoch seconds of the last reconciliation. Never moves backward.
    pub last_reconciled: i64,
    /// Whether the one-time starter grant has been handed out.
    #[serde(default)]
    pub starter_claimed: bool,
}

/// Catalog template a worker is created from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Archetype {
    /// Display name, unique per account roster.
    pub name: String,
    #[serde(default)]
    pub rarity: Rarity,
    /// Base currency per active second (>= 0).
    pub income: Decimal,
    /// Popularity driving fan growth (>= 0).
    pub popularity: Decimal,
}

/// A managed asset owned by exactly one account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Worker identity.
    pub id: WorkerId,
    /// Owning account.
    pub account: AccountId,
    /// Display name.
    pub name: String,
    #[serde(default)]
    pub rarity: Rarity,
    /// Currency per second while active.
    pub income: Decimal,
    /// Drives fan growth.
    pub popularity: Decimal,
    /// Accumulated fans, never decreasing.
    pub fans: Decimal,
    /// Stamina in [0, 100].
    pub stamina: Decimal,
    /// Engagement state.
    pub activity: Activity,
    /// Level in 1..=level_cap.
    pub level: u32,
    /// Progress toward the next level; arbitrary magnitude.
    pub experience: BigDecimal,
}

impl Worker {
    /// Fresh worker built from an archetype: level 1, no experience, full
    /// stamina and active.
    pub fn from_archetype(id: WorkerId, account: AccountId, archetype: &Archetype) -> Self {
        Self {
            id,
            account,
            name: archetype.name.clone(),
            rarity: archetype.rarity,
            income: archetype.income,
            popularity: archetype.popularity,
            fans: Decimal::ZERO,
            stamina: STAMINA_MAX,
            activity: Activity::Active,
            level: 1,
            experience: BigDecimal::from(0),
        }
    }

    /// Fields written back by a reconciliation pass.
    pub fn to_update(&self) -> WorkerUpdate {
        WorkerUpdate {
            id: self.id,
            stamina: self.stamina,
            activity: self.activity,
            fans: self.fans,
            experience: self.experience.clone(),
            level: self.level,
            income: self.income,
        }
    }
}

/// Consistent read of one account and its roster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Account row.
    pub account: Account,
    /// All workers owned by the account, ordered by id.
    pub workers: Vec<Worker>,
}

/// Per-worker state produced by reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerUpdate {
    pub id: WorkerId,
    pub stamina: Decimal,
    pub activity: Activity,
    pub fans: Decimal,
    pub experience: BigDecimal,
    pub level: u32,
    pub income: Decimal,
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Rate must be strictly positive.
    #[error("{0} must be > 0")]
    NonPositiveRate(&'static str),
    /// Rate must be non-negative.
    #[error("{0} must be >= 0")]
    NegativeRate(&'static str),
    /// Level cap must be at least 1.
    #[error("level cap {0} is invalid, must be >= 1")]
    InvalidLevelCap(u32),
    /// Names must contain visible characters.
    #[error("name must not be empty")]
    EmptyName,
    /// Price or income must be non-negative.
    #[error("negative monetary value is invalid")]
    NegativeMoney,
    #[error("unknown rarity {0:?}")]
    UnknownRarity(String),
    /// At least one rarity needs a positive weight.
    #[error("rarity weights must not all be zero")]
    EmptyRarityWeights,
    #[error("duplicate cashback {0} must be within [0, 1]")]
    InvalidCashback(Decimal),
}

/// Validate an archetype before a worker is enlisted from it.
pub fn validate_archetype(a: &Archetype) -> Result<(), ValidationError> {
    if a.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if a.income < Decimal::ZERO {
        return Err(ValidationError::NegativeMoney);
    }
    if a.popularity < Decimal::ZERO {
        return Err(ValidationError::NegativeRate("popularity"));
    }
    Ok(())
}

/// A corrupted field found on a stored record and the value it was reset to.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum Violation {
    #[error("account {account}: negative balance {found} reset to 0")]
    NegativeBalance { account: AccountId, found: Decimal },
    #[error("worker {worker}: stamina {found} clamped to {clamped}")]
    StaminaOutOfRange {
        worker: WorkerId,
        found: Decimal,
        clamped: Decimal,
    },
    #[error("worker {worker}: level {found} clamped to {clamped}")]
    LevelOutOfRange {
        worker: WorkerId,
        found: u32,
        clamped: u32,
    },
    #[error("worker {worker}: negative fans {found} reset to 0")]
    NegativeFans { worker: WorkerId, found: Decimal },
    #[error("worker {worker}: negative popularity {found} reset to 0")]
    NegativePopularity { worker: WorkerId, found: Decimal },
    #[error("worker {worker}: negative income {found} reset to 0")]
    NegativeIncome { worker: WorkerId, found: Decimal },
    #[error("worker {worker}: negative experience {found} reset to 0")]
    NegativeExperience { worker: WorkerId, found: BigDecimal },
    #[error("worker {worker}: experience {found} held at level cap, reset to 0")]
    ExperienceAtCap { worker: WorkerId, found: BigDecimal },
}

/// Clamp a worker's fields back into their legal ranges.
///
/// Returns every correction made; an empty vector means the record was clean.
/// Experience above the current requirement is left alone: the leveling
/// ladder resolves it on the next pass.
pub fn normalize_worker(w: &mut Worker, level_cap: u32) -> Vec<Violation> {
    let mut out = Vec::new();
    if w.stamina < STAMINA_MIN || w.stamina > STAMINA_MAX {
        let clamped = w.stamina.clamp(STAMINA_MIN, STAMINA_MAX);
        out.push(Violation::StaminaOutOfRange {
            worker: w.id,
            found: w.stamina,
            clamped,
        });
        w.stamina = clamped;
    }
    let cap = level_cap.max(1);
    if w.level < 1 || w.level > cap {
        let clamped = w.level.clamp(1, cap);
        out.push(Violation::LevelOutOfRange {
            worker: w.id,
            found: w.level,
            clamped,
        });
        w.level = clamped;
    }
    if w.fans < Decimal::ZERO {
        out.push(Violation::NegativeFans {
            worker: w.id,
            found: w.fans,
        });
        w.fans = Decimal::ZERO;
    }
    if w.popularity < Decimal::ZERO {
        out.push(Violation::NegativePopularity {
            worker: w.id,
            found: w.popularity,
        });
        w.popularity = Decimal::ZERO;
    }
    if w.income < Decimal::ZERO {
        out.push(Violation::NegativeIncome {
            worker: w.id,
            found: w.income,
        });
        w.income = Decimal::ZERO;
    }
    let zero = BigDecimal::from(0);
    if w.experience < zero {
        out.push(Violation::NegativeExperience {
            worker: w.id,
            found: w.experience.clone(),
        });
        w.experience = zero;
    } else if w.level >= cap && w.experience != zero {
        out.push(Violation::ExperienceAtCap {
            worker: w.id,
            found: w.experience.clone(),
        });
        w.experience = zero;
    }
    out
}

/// Normalize an account snapshot in place; see [`normalize_worker`].
pub fn normalize_snapshot(s: &mut AccountSnapshot, level_cap: u32) -> Vec<Violation> {
    let mut out = Vec::new();
    if s.account.balance < Decimal::ZERO {
        out.push(Violation::NegativeBalance {
            account: s.account.id,
            found: s.account.balance,
        });
        s.account.balance = Decimal::ZERO;
    }
    for w in &mut s.workers {
        out.extend(normalize_worker(w, level_cap));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::str::FromStr;

    fn archetype() -> Archetype {
        Archetype {
            name: "Aiko".to_string(),
            rarity: Rarity::SR,
            income: Decimal::new(15, 1),
            popularity: Decimal::new(2, 0),
        }
    }

    fn worker() -> Worker {
        Worker::from_archetype(WorkerId(7), AccountId(1), &archetype())
    }

    #[test]
    fn new_worker_defaults() {
        let w = worker();
        assert_eq!(w.level, 1);
        assert_eq!(w.stamina, STAMINA_MAX);
        assert_eq!(w.activity, Activity::Active);
        assert_eq!(w.fans, Decimal::ZERO);
        assert_eq!(w.experience, BigDecimal::from(0));
        assert_eq!(w.income, Decimal::new(15, 1));
        assert_eq!(w.rarity, Rarity::SR);
    }

    #[test]
    fn rarity_codes_parse() {
        assert_eq!("ssr".parse::<Rarity>(), Ok(Rarity::SSR));
        assert_eq!(Rarity::UR.to_string(), "UR");
        assert_eq!(
            "S".parse::<Rarity>(),
            Err(ValidationError::UnknownRarity("S".into()))
        );
        assert!(Rarity::N < Rarity::UR);
    }

    #[test]
    fn negative_popularity_is_reset() {
        let mut w = worker();
        w.popularity = Decimal::new(-5, 0);
        w.fans = Decimal::new(10, 0);
        let v = normalize_worker(&mut w, 9999);
        assert_eq!(
            v,
            vec![Violation::NegativePopularity {
                worker: w.id,
                found: Decimal::new(-5, 0),
            }]
        );
        assert_eq!(w.popularity, Decimal::ZERO);
        assert_eq!(w.fans, Decimal::new(10, 0));
    }

    #[test]
    fn activity_flag_roundtrip() {
        assert_eq!(Activity::from_flag(true), Activity::Active);
        assert!(!Activity::Resting.is_active());
        assert_eq!(Activity::Active.toggled(), Activity::Resting);
    }

    #[test]
    fn archetype_validation() {
        validate_archetype(&archetype()).unwrap();
        let mut a = archetype();
        a.name = "   ".into();
        assert_eq!(validate_archetype(&a), Err(ValidationError::EmptyName));
        let mut a = archetype();
        a.income = Decimal::new(-1, 0);
        assert_eq!(validate_archetype(&a), Err(ValidationError::NegativeMoney));
    }

    #[test]
    fn clean_worker_has_no_violations() {
        let mut w = worker();
        assert!(normalize_worker(&mut w, 9999).is_empty());
    }

    #[test]
    fn corrupted_worker_is_clamped() {
        let mut w = worker();
        w.stamina = Decimal::new(1205, 1);
        w.level = 0;
        w.fans = Decimal::new(-3, 0);
        w.experience = BigDecimal::from(-5);
        let v = normalize_worker(&mut w, 9999);
        assert_eq!(v.len(), 4);
        assert_eq!(w.stamina, STAMINA_MAX);
        assert_eq!(w.level, 1);
        assert_eq!(w.fans, Decimal::ZERO);
        assert_eq!(w.experience, BigDecimal::from(0));
    }

    #[test]
    fn experience_pinned_at_cap() {
        let mut w = worker();
        w.level = 12;
        w.experience = BigDecimal::from_str("123.5").unwrap();
        let v = normalize_worker(&mut w, 10);
        assert_eq!(w.level, 10);
        assert_eq!(w.experience, BigDecimal::from(0));
        assert!(matches!(v[0], Violation::LevelOutOfRange { found: 12, clamped: 10, .. }));
        assert!(matches!(v[1], Violation::ExperienceAtCap { .. }));
    }

    #[test]
    fn snapshot_serde_roundtrip() {
        let snap = AccountSnapshot {
            account: Account {
                id: AccountId(1),
                balance: Decimal::new(100050, 2),
                last_reconciled: 1_700_000_000,
                starter_claimed: true,
            },
            workers: vec![worker()],
        };
        let s = serde_json::to_string(&snap).unwrap();
        let back: AccountSnapshot = serde_json::from_str(&s).unwrap();
        assert_eq!(back, snap);

        // Records written before rarity and the starter flag existed.
        let old = r#"{"id": 3, "balance": "5", "last_reconciled": 9}"#;
        let account: Account = serde_json::from_str(old).unwrap();
        assert!(!account.starter_claimed);
    }

    proptest! {
        #[test]
        fn normalized_stamina_in_range(milli in -500_000i64..500_000) {
            let mut w = worker();
            w.stamina = Decimal::new(milli, 3);
            normalize_worker(&mut w, 9999);
            prop_assert!(w.stamina >= STAMINA_MIN && w.stamina <= STAMINA_MAX);
        }
    }
}
