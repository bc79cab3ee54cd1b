#![deny(warnings)]

//! Persistence layer: account/worker storage with guarded atomic commits.
//!
//! Every write that depends on a previously read state is guarded on the
//! account's `last_reconciled` watermark. A write whose guard no longer
//! matches fails with [`StoreError::Conflict`] and changes nothing, which lets
//! callers re-read and retry instead of double-counting elapsed time.

use std::future::Future;
use std::str::FromStr;

use agency_core::{
    AccountId, AccountSnapshot, Activity, Archetype, StarterGrant, Worker, WorkerId, WorkerUpdate,
};
use bigdecimal::BigDecimal;
use rust_decimal::Decimal;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{init_db, SqliteStore};

/// Returns the default SQLite URL used for local saves.
pub fn default_sqlite_url() -> &'static str {
    "sqlite://./saves/agency.db"
}

/// Errors surfaced by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The guarded state changed since it was read; nothing was written.
    #[error("account {0} was modified concurrently")]
    Conflict(AccountId),
    /// No such account.
    #[error("account {0} not found")]
    AccountNotFound(AccountId),
    /// No such worker on the account.
    #[error("worker {worker} not found on account {account}")]
    WorkerNotFound { account: AccountId, worker: WorkerId },
    /// Worker names are unique per account.
    #[error("account {account} already has a worker named {name:?}")]
    DuplicateWorker { account: AccountId, name: String },
    /// A stored value could not be decoded.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
    /// The backend is unavailable or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Backend(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// State written by one reconciliation, applied all-or-nothing.
#[derive(Clone, Copy, Debug)]
pub struct Commit<'a> {
    /// Watermark the plan was computed from; the write is rejected otherwise.
    pub expected_last_reconciled: i64,
    pub new_balance: Decimal,
    pub new_last_reconciled: i64,
    pub updates: &'a [WorkerUpdate],
}

/// Read/write contract the reconciler relies on.
///
/// Implementations must make each method atomic: it either lands completely
/// or leaves storage untouched.
pub trait AccountStore: Send + Sync {
    /// Account row plus its roster, or `None` if the account does not exist.
    fn load_snapshot(
        &self,
        account: AccountId,
    ) -> impl Future<Output = Result<Option<AccountSnapshot>, StoreError>> + Send;

    /// Persist a reconciliation, guarded on `expected_last_reconciled`.
    fn commit_reconciliation(
        &self,
        account: AccountId,
        commit: Commit<'_>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Create an empty account reconciled at `now`. Returns `false` if it
    /// already existed, in which case nothing changes.
    fn create_account(
        &self,
        account: AccountId,
        now: i64,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Add a fresh worker built from `archetype`, guarded on the watermark.
    fn insert_worker(
        &self,
        account: AccountId,
        archetype: &Archetype,
        expected_last_reconciled: i64,
    ) -> impl Future<Output = Result<Worker, StoreError>> + Send;

    /// Set one worker's activity flag, guarded on the watermark.
    fn set_activity(
        &self,
        account: AccountId,
        worker: WorkerId,
        activity: Activity,
        expected_last_reconciled: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Replace the balance, guarded on both the watermark and the balance read.
    fn set_balance(
        &self,
        account: AccountId,
        expected_last_reconciled: i64,
        expected_balance: Decimal,
        new_balance: Decimal,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Charge for and add a worker in one write, guarded like
    /// [`AccountStore::set_balance`]. A name already on the roster fails with
    /// [`StoreError::DuplicateWorker`] and charges nothing.
    fn purchase_worker(
        &self,
        account: AccountId,
        archetype: &Archetype,
        expected_last_reconciled: i64,
        expected_balance: Decimal,
        new_balance: Decimal,
    ) -> impl Future<Output = Result<Worker, StoreError>> + Send;

    /// Hand out the starter grant once, guarded on the watermark.
    ///
    /// `None` if it was already claimed or the roster is not empty; the
    /// account is marked claimed either way.
    fn claim_starter(
        &self,
        account: AccountId,
        grant: &StarterGrant,
        expected_last_reconciled: i64,
    ) -> impl Future<Output = Result<Option<Worker>, StoreError>> + Send;
}

/// Canonical text form of a fixed-point value.
pub(crate) fn decimal_to_text(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn decimal_from_text(field: &str, text: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(text.trim())
        .map_err(|e| StoreError::Corrupt(format!("{field} = {text:?}: {e}")))
}

/// Lossless text form of experience at any magnitude.
pub fn experience_to_text(value: &BigDecimal) -> String {
    let normalized = value.normalized();
    if normalized == BigDecimal::from(0) {
        return "0".to_string();
    }
    normalized.to_string()
}

/// Parse experience written by [`experience_to_text`] (or any decimal text).
pub fn experience_from_text(text: &str) -> Result<BigDecimal, StoreError> {
    BigDecimal::from_str(text.trim())
        .map_err(|e| StoreError::Corrupt(format!("experience = {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn url_is_sqlite() {
        assert!(default_sqlite_url().starts_with("sqlite://"));
    }

    #[test]
    fn huge_experience_survives_text() {
        let two = BigDecimal::from(2);
        let mut v = BigDecimal::from(10);
        for _ in 0..4000 {
            v = &v * &two;
        }
        let v = v + BigDecimal::from_str("0.125").unwrap();
        let back = experience_from_text(&experience_to_text(&v)).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn zero_experience_is_plain() {
        assert_eq!(experience_to_text(&BigDecimal::from_str("0.000").unwrap()), "0");
    }

    #[test]
    fn corrupt_text_is_reported() {
        assert!(matches!(
            decimal_from_text("balance", "12,5"),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(experience_from_text("lots"), Err(StoreError::Corrupt(_))));
    }

    proptest! {
        #[test]
        fn decimal_text_is_lossless(mantissa in any::<i64>(), scale in 0u32..12) {
            let d = Decimal::new(mantissa, scale);
            prop_assert_eq!(decimal_from_text("x", &decimal_to_text(d)).unwrap(), d);
        }
    }
}
