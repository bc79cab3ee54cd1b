#![deny(warnings)]

//! Economic models for the idle agency: stamina, leveling and accrual.
//!
//! This crate provides the pure, deterministic parts of a reconciliation:
//! - Closed-form stamina automaton over arbitrary elapsed windows
//! - Exponential leveling ladder with arbitrary-precision experience
//! - Per-worker accrual and the account-level reconciliation planner
//! - Weighted scouting draws

use thiserror::Error;

pub mod ladder;
pub mod reconcile;
pub mod scouting;
pub mod stamina;

pub use ladder::{progress_to_next, requirement, LadderContext, Progress, Progression};
pub use reconcile::{
    accrue_worker, apply_plan, plan_reconciliation, ReconciliationPlan, ReconciliationResult,
    WorkerAccrual,
};
pub use scouting::{draw, pick_candidate, roll_rarity};
pub use stamina::{advance, StaminaOutcome};

/// Errors produced by economic helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EconError {
    /// A fixed-point quantity left the representable range.
    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
}
