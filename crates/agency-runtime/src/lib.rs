#![deny(warnings)]

//! Tick reconciler and player actions for the idle agency.
//!
//! State only advances when an account is touched: every entry point here
//! reconciles the elapsed time first, so callers always observe up-to-date
//! accrual. Commits are optimistic; a lost race re-reads and re-plans.

use agency_core::{
    normalize_snapshot, validate_archetype, AccountId, AccountSnapshot, Activity, Archetype,
    EconomyPolicy, Rarity, ScoutingPolicy, StarterGrant, ValidationError, Worker, WorkerId,
};
use agency_econ::{
    apply_plan, draw, plan_reconciliation, EconError, LadderContext, ReconciliationResult,
};
use persistence::{AccountStore, Commit, StoreError};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod clock;
pub mod config;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RuntimeConfig;

/// Errors surfaced to callers of the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Econ(#[from] EconError),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// Every retry lost an optimistic-concurrency race.
    #[error("account {account} still contended after {attempts} attempts")]
    Contended { account: AccountId, attempts: u32 },
    #[error("account {0} not found")]
    AccountNotFound(AccountId),
    #[error("worker {worker} not found on account {account}")]
    WorkerNotFound { account: AccountId, worker: WorkerId },
    #[error("account {account} already has a worker named {name:?}")]
    DuplicateWorker { account: AccountId, name: String },
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Decimal, requested: Decimal },
    #[error("amount must be positive, got {0}")]
    InvalidAmount(Decimal),
    /// Scouting needs at least one candidate.
    #[error("scouting pool is empty")]
    EmptyPool,
    #[error("config: {0}")]
    Config(String),
}

impl From<StoreError> for RuntimeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AccountNotFound(a) => RuntimeError::AccountNotFound(a),
            StoreError::WorkerNotFound { account, worker } => {
                RuntimeError::WorkerNotFound { account, worker }
            }
            StoreError::DuplicateWorker { account, name } => {
                RuntimeError::DuplicateWorker { account, name }
            }
            other => RuntimeError::Store(other),
        }
    }
}

impl RuntimeError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RuntimeError::Contended { .. }
                | RuntimeError::Store(StoreError::Unavailable(_))
                | RuntimeError::Store(StoreError::Backend(_))
                | RuntimeError::Store(StoreError::Conflict(_))
        )
    }
}

/// What a scouting draw produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoutOutcome {
    /// A new worker joined the roster.
    Recruited(Worker),
    /// The drawn name was already on the roster; part of the cost came back.
    Duplicate { name: String, cashback: Decimal },
}

/// Result of [`Agency::scout`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScoutReceipt {
    /// Tier of the drawn candidate.
    pub rarity: Rarity,
    pub outcome: ScoutOutcome,
    /// Balance after the charge and any cashback.
    pub balance: Decimal,
}

/// The agency service: reconciler plus reconcile-first player actions.
#[derive(Debug)]
pub struct Agency<S, C = SystemClock> {
    store: S,
    clock: C,
    policy: EconomyPolicy,
    ladder: LadderContext,
    scouting: ScoutingPolicy,
    starter: StarterGrant,
    max_commit_retries: u32,
}

impl<S: AccountStore, C: Clock> Agency<S, C> {
    /// Build a service over `store`, validating the configured policy.
    pub fn new(store: S, clock: C, config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            ladder: LadderContext::for_policy(&config.policy),
            policy: config.policy.clone(),
            scouting: config.scouting.clone(),
            starter: config.starter.clone(),
            max_commit_retries: config.max_commit_retries,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn policy(&self) -> &EconomyPolicy {
        &self.policy
    }

    pub fn scouting(&self) -> &ScoutingPolicy {
        &self.scouting
    }

    /// Reconcile the account with the current time.
    ///
    /// A missing account or zero elapsed time yields an empty result and no
    /// writes.
    pub async fn reconcile(
        &self,
        account: AccountId,
    ) -> Result<ReconciliationResult, RuntimeError> {
        let (result, _) = self.reconcile_snapshot(account).await?;
        Ok(result)
    }

    /// Reconcile and return the resulting state alongside the summary.
    async fn reconcile_snapshot(
        &self,
        account: AccountId,
    ) -> Result<(ReconciliationResult, Option<AccountSnapshot>), RuntimeError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let Some(mut snap) = self.store.load_snapshot(account).await? else {
                return Ok((ReconciliationResult::empty(), None));
            };
            for v in normalize_snapshot(&mut snap, self.policy.level_cap) {
                warn!(account = account.0, violation = %v, "normalized stored record");
            }
            let now = self.clock.now();
            let Some(plan) = plan_reconciliation(&self.policy, &self.ladder, &snap, now)? else {
                return Ok((ReconciliationResult::empty(), Some(snap)));
            };
            let commit = Commit {
                expected_last_reconciled: plan.expected_last_reconciled,
                new_balance: plan.new_balance,
                new_last_reconciled: plan.new_last_reconciled,
                updates: &plan.updates,
            };
            match self.store.commit_reconciliation(account, commit).await {
                Ok(()) => {
                    apply_plan(&mut snap, &plan);
                    debug!(
                        account = account.0,
                        elapsed = plan.result.elapsed_seconds,
                        income = %plan.result.income_gain,
                        passive = %plan.result.passive_gain,
                        leveled = plan.result.leveled_up.len(),
                        "reconciled"
                    );
                    return Ok((plan.result, Some(snap)));
                }
                Err(StoreError::Conflict(_)) if attempts <= self.max_commit_retries => {
                    warn!(account = account.0, attempts, "commit conflict, retrying");
                }
                Err(StoreError::Conflict(_)) => {
                    return Err(RuntimeError::Contended { account, attempts });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reconciled snapshot of an existing account.
    async fn fresh(&self, account: AccountId) -> Result<AccountSnapshot, RuntimeError> {
        match self.reconcile_snapshot(account).await? {
            (_, Some(snap)) => Ok(snap),
            (_, None) => Err(RuntimeError::AccountNotFound(account)),
        }
    }

    /// Decide whether a guarded write that failed should be attempted again.
    fn retry(
        &self,
        account: AccountId,
        err: StoreError,
        attempts: &mut u32,
    ) -> Result<(), RuntimeError> {
        *attempts += 1;
        match err {
            StoreError::Conflict(_) if *attempts <= self.max_commit_retries => {
                warn!(account = account.0, attempts = *attempts, "action conflict, retrying");
                Ok(())
            }
            StoreError::Conflict(_) => Err(RuntimeError::Contended {
                account,
                attempts: *attempts,
            }),
            other => Err(other.into()),
        }
    }

    /// Create the account if it does not exist yet. Returns whether it was
    /// created.
    pub async fn open_account(&self, account: AccountId) -> Result<bool, RuntimeError> {
        let created = self.store.create_account(account, self.clock.now()).await?;
        if !created {
            self.reconcile(account).await?;
        }
        Ok(created)
    }

    /// Current roster, reconciled.
    pub async fn roster(&self, account: AccountId) -> Result<AccountSnapshot, RuntimeError> {
        self.fresh(account).await
    }

    /// Add a worker built from `archetype` to the account.
    pub async fn enlist(
        &self,
        account: AccountId,
        archetype: &Archetype,
    ) -> Result<Worker, RuntimeError> {
        validate_archetype(archetype)?;
        let mut attempts = 0;
        loop {
            let snap = self.fresh(account).await?;
            match self
                .store
                .insert_worker(account, archetype, snap.account.last_reconciled)
                .await
            {
                Ok(w) => return Ok(w),
                Err(e) => self.retry(account, e, &mut attempts)?,
            }
        }
    }

    /// Put a worker into `activity`. Returns the state before the change.
    pub async fn set_activity(
        &self,
        account: AccountId,
        worker: WorkerId,
        activity: Activity,
    ) -> Result<Activity, RuntimeError> {
        self.update_activity(account, worker, |_| activity).await
    }

    /// Flip a worker between active and resting. Returns the new state.
    pub async fn toggle_activity(
        &self,
        account: AccountId,
        worker: WorkerId,
    ) -> Result<Activity, RuntimeError> {
        let before = self.update_activity(account, worker, Activity::toggled).await?;
        Ok(before.toggled())
    }

    async fn update_activity(
        &self,
        account: AccountId,
        worker: WorkerId,
        next: impl Fn(Activity) -> Activity,
    ) -> Result<Activity, RuntimeError> {
        let mut attempts = 0;
        loop {
            let snap = self.fresh(account).await?;
            let current = snap
                .workers
                .iter()
                .find(|w| w.id == worker)
                .map(|w| w.activity)
                .ok_or(RuntimeError::WorkerNotFound { account, worker })?;
            match self
                .store
                .set_activity(account, worker, next(current), snap.account.last_reconciled)
                .await
            {
                Ok(()) => return Ok(current),
                Err(e) => self.retry(account, e, &mut attempts)?,
            }
        }
    }

    /// Debit `amount` from the balance. Returns the new balance.
    pub async fn spend(
        &self,
        account: AccountId,
        amount: Decimal,
    ) -> Result<Decimal, RuntimeError> {
        if amount <= Decimal::ZERO {
            return Err(RuntimeError::InvalidAmount(amount));
        }
        self.adjust_balance(account, |balance| {
            if balance < amount {
                Err(RuntimeError::InsufficientFunds {
                    balance,
                    requested: amount,
                })
            } else {
                Ok(balance - amount)
            }
        })
        .await
    }

    /// Credit `amount` to the balance. Returns the new balance.
    pub async fn grant(
        &self,
        account: AccountId,
        amount: Decimal,
    ) -> Result<Decimal, RuntimeError> {
        if amount <= Decimal::ZERO {
            return Err(RuntimeError::InvalidAmount(amount));
        }
        self.adjust_balance(account, |balance| {
            balance
                .checked_add(amount)
                .ok_or(RuntimeError::Econ(EconError::Overflow("balance")))
        })
        .await
    }

    async fn adjust_balance(
        &self,
        account: AccountId,
        next: impl Fn(Decimal) -> Result<Decimal, RuntimeError>,
    ) -> Result<Decimal, RuntimeError> {
        let mut attempts = 0;
        loop {
            let snap = self.fresh(account).await?;
            let balance = snap.account.balance;
            let new_balance = next(balance)?;
            match self
                .store
                .set_balance(account, snap.account.last_reconciled, balance, new_balance)
                .await
            {
                Ok(()) => return Ok(new_balance),
                Err(e) => self.retry(account, e, &mut attempts)?,
            }
        }
    }

    /// Pay the scouting cost and draw one candidate from `pool`.
    ///
    /// A candidate already on the roster is not added again; the configured
    /// cashback is credited instead. The draw happens once, so a retried
    /// write never re-rolls.
    pub async fn scout<R: Rng + ?Sized>(
        &self,
        account: AccountId,
        pool: &[Archetype],
        rng: &mut R,
    ) -> Result<ScoutReceipt, RuntimeError> {
        let picked = draw(&self.scouting, pool, rng).ok_or(RuntimeError::EmptyPool)?;
        validate_archetype(picked)?;
        let cost = self.scouting.cost;
        let cashback = self.scouting.cashback();
        let mut attempts = 0;
        loop {
            let snap = self.fresh(account).await?;
            let balance = snap.account.balance;
            if balance < cost {
                return Err(RuntimeError::InsufficientFunds {
                    balance,
                    requested: cost,
                });
            }
            let watermark = snap.account.last_reconciled;
            let duplicate = snap.workers.iter().any(|w| w.name == picked.name);
            let res = if duplicate {
                let new_balance = balance - cost + cashback;
                self.store
                    .set_balance(account, watermark, balance, new_balance)
                    .await
                    .map(|()| {
                        let outcome = ScoutOutcome::Duplicate {
                            name: picked.name.clone(),
                            cashback,
                        };
                        (outcome, new_balance)
                    })
            } else {
                let new_balance = balance - cost;
                self.store
                    .purchase_worker(account, picked, watermark, balance, new_balance)
                    .await
                    .map(|w| (ScoutOutcome::Recruited(w), new_balance))
            };
            match res {
                Ok((outcome, balance)) => {
                    info!(
                        account = account.0,
                        candidate = %picked.name,
                        rarity = %picked.rarity,
                        duplicate,
                        "scouted"
                    );
                    return Ok(ScoutReceipt {
                        rarity: picked.rarity,
                        outcome,
                        balance,
                    });
                }
                Err(e) => self.retry(account, e, &mut attempts)?,
            }
        }
    }

    /// Hand out the starter grant if the account never had it and has no
    /// workers yet. Returns the starter worker when granted.
    pub async fn claim_starter(&self, account: AccountId) -> Result<Option<Worker>, RuntimeError> {
        let mut attempts = 0;
        loop {
            let snap = self.fresh(account).await?;
            match self
                .store
                .claim_starter(account, &self.starter, snap.account.last_reconciled)
                .await
            {
                Ok(granted) => return Ok(granted),
                Err(e) => self.retry(account, e, &mut attempts)?,
            }
        }
    }
}
