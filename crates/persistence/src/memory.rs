//! In-process store for tests and dry runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use agency_core::{
    Account, AccountId, AccountSnapshot, Activity, Archetype, StarterGrant, Worker, WorkerId,
};
use rust_decimal::Decimal;

use crate::{AccountStore, Commit, StoreError};

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<AccountId, AccountSnapshot>,
    next_worker: i64,
}

/// [`AccountStore`] kept in a mutex-guarded map.
///
/// Offers hooks to simulate lost races and backend outages.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    injected_conflicts: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` guarded writes fail with [`StoreError::Conflict`].
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Make every operation fail with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Overwrite a stored snapshot, bypassing every guard.
    pub fn put_snapshot(&self, snapshot: AccountSnapshot) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let max_id = snapshot.workers.iter().map(|w| w.id.0).max().unwrap_or(0);
        state.next_worker = state.next_worker.max(max_id);
        state.accounts.insert(snapshot.account.id, snapshot);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked down".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn guarded<'s>(
        &self,
        state: &'s mut State,
        account: AccountId,
        expected_last_reconciled: i64,
    ) -> Result<&'s mut AccountSnapshot, StoreError> {
        let snap = state
            .accounts
            .get_mut(&account)
            .ok_or(StoreError::AccountNotFound(account))?;
        if self.take_injected_conflict() || snap.account.last_reconciled != expected_last_reconciled
        {
            return Err(StoreError::Conflict(account));
        }
        Ok(snap)
    }
}

impl AccountStore for MemoryStore {
    async fn load_snapshot(
        &self,
        account: AccountId,
    ) -> Result<Option<AccountSnapshot>, StoreError> {
        Ok(self.lock()?.accounts.get(&account).cloned())
    }

    async fn commit_reconciliation(
        &self,
        account: AccountId,
        commit: Commit<'_>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let snap = self.guarded(&mut state, account, commit.expected_last_reconciled)?;
        // Validate every target before touching anything.
        if let Some(u) = commit
            .updates
            .iter()
            .find(|u| !snap.workers.iter().any(|w| w.id == u.id))
        {
            return Err(StoreError::WorkerNotFound {
                account,
                worker: u.id,
            });
        }
        snap.account.balance = commit.new_balance;
        snap.account.last_reconciled = commit.new_last_reconciled;
        for u in commit.updates {
            if let Some(w) = snap.workers.iter_mut().find(|w| w.id == u.id) {
                w.stamina = u.stamina;
                w.activity = u.activity;
                w.fans = u.fans;
                w.experience = u.experience.clone();
                w.level = u.level;
                w.income = u.income;
            }
        }
        Ok(())
    }

    async fn create_account(&self, account: AccountId, now: i64) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        if state.accounts.contains_key(&account) {
            return Ok(false);
        }
        state.accounts.insert(
            account,
            AccountSnapshot {
                account: Account {
                    id: account,
                    balance: Decimal::ZERO,
                    last_reconciled: now,
                    starter_claimed: false,
                },
                workers: Vec::new(),
            },
        );
        Ok(true)
    }

    async fn insert_worker(
        &self,
        account: AccountId,
        archetype: &Archetype,
        expected_last_reconciled: i64,
    ) -> Result<Worker, StoreError> {
        let mut state = self.lock()?;
        let id = WorkerId(state.next_worker + 1);
        let snap = self.guarded(&mut state, account, expected_last_reconciled)?;
        if snap.workers.iter().any(|w| w.name == archetype.name) {
            return Err(StoreError::DuplicateWorker {
                account,
                name: archetype.name.clone(),
            });
        }
        let worker = Worker::from_archetype(id, account, archetype);
        snap.workers.push(worker.clone());
        state.next_worker = id.0;
        Ok(worker)
    }

    async fn set_activity(
        &self,
        account: AccountId,
        worker: WorkerId,
        activity: Activity,
        expected_last_reconciled: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let snap = self.guarded(&mut state, account, expected_last_reconciled)?;
        let w = snap
            .workers
            .iter_mut()
            .find(|w| w.id == worker)
            .ok_or(StoreError::WorkerNotFound { account, worker })?;
        w.activity = activity;
        Ok(())
    }

    async fn set_balance(
        &self,
        account: AccountId,
        expected_last_reconciled: i64,
        expected_balance: Decimal,
        new_balance: Decimal,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let snap = self.guarded(&mut state, account, expected_last_reconciled)?;
        if snap.account.balance != expected_balance {
            return Err(StoreError::Conflict(account));
        }
        snap.account.balance = new_balance;
        Ok(())
    }

    async fn purchase_worker(
        &self,
        account: AccountId,
        archetype: &Archetype,
        expected_last_reconciled: i64,
        expected_balance: Decimal,
        new_balance: Decimal,
    ) -> Result<Worker, StoreError> {
        let mut state = self.lock()?;
        let id = WorkerId(state.next_worker + 1);
        let snap = self.guarded(&mut state, account, expected_last_reconciled)?;
        if snap.account.balance != expected_balance {
            return Err(StoreError::Conflict(account));
        }
        if snap.workers.iter().any(|w| w.name == archetype.name) {
            return Err(StoreError::DuplicateWorker {
                account,
                name: archetype.name.clone(),
            });
        }
        let worker = Worker::from_archetype(id, account, archetype);
        snap.account.balance = new_balance;
        snap.workers.push(worker.clone());
        state.next_worker = id.0;
        Ok(worker)
    }

    async fn claim_starter(
        &self,
        account: AccountId,
        grant: &StarterGrant,
        expected_last_reconciled: i64,
    ) -> Result<Option<Worker>, StoreError> {
        let mut state = self.lock()?;
        let id = WorkerId(state.next_worker + 1);
        let snap = self.guarded(&mut state, account, expected_last_reconciled)?;
        let eligible = !snap.account.starter_claimed && snap.workers.is_empty();
        snap.account.starter_claimed = true;
        if !eligible {
            return Ok(None);
        }
        let current = snap.account.balance;
        let balance = current
            .checked_add(grant.bonus)
            .ok_or_else(|| StoreError::Corrupt(format!("balance {current} overflows")))?;
        let worker = Worker::from_archetype(id, account, &grant.worker);
        snap.account.balance = balance;
        snap.workers.push(worker.clone());
        state.next_worker = id.0;
        Ok(Some(worker))
    }
}
