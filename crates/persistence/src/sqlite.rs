//! SQLite-backed store on `sqlx`.

use std::str::FromStr;

use agency_core::{
    Account, AccountId, AccountSnapshot, Activity, Archetype, Rarity, StarterGrant, Worker,
    WorkerId,
};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::{
    decimal_from_text, decimal_to_text, experience_from_text, experience_to_text, AccountStore,
    Commit, StoreError,
};

/// Open (creating if missing) the database at `url` and apply migrations.
pub async fn init_db(url: &str) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let mut pool_opts = SqlitePoolOptions::new().max_connections(4);
    if url.contains(":memory:") {
        // An in-memory database lives and dies with its single connection.
        pool_opts = pool_opts
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }
    let pool = pool_opts.connect_with(opts).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// [`AccountStore`] over a SQLite pool.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an already migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and migrate.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(init_db(url).await?))
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn worker_from_row(row: &SqliteRow) -> Result<Worker, StoreError> {
    let level: i64 = row.try_get("level")?;
    let rarity: &str = row.try_get("rarity")?;
    Ok(Worker {
        id: WorkerId(row.try_get("worker_id")?),
        account: AccountId(row.try_get("account_id")?),
        name: row.try_get("name")?,
        rarity: Rarity::from_str(rarity).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        income: decimal_from_text("income", row.try_get("income")?)?,
        popularity: decimal_from_text("popularity", row.try_get("popularity")?)?,
        fans: decimal_from_text("fans", row.try_get("fans")?)?,
        stamina: decimal_from_text("stamina", row.try_get("stamina")?)?,
        activity: Activity::from_flag(row.try_get::<i64, _>("working")? != 0),
        // Out-of-range levels are clamped by normalization after loading.
        level: u32::try_from(level.max(0)).unwrap_or(u32::MAX),
        experience: experience_from_text(row.try_get("experience")?)?,
    })
}

/// Take the account's write lock and check the watermark in one statement.
async fn guard(
    tx: &mut Transaction<'_, Sqlite>,
    account: AccountId,
    expected_last_reconciled: i64,
) -> Result<(), StoreError> {
    let res = sqlx::query(
        "UPDATE accounts SET last_reconciled = last_reconciled \
         WHERE account_id = ? AND last_reconciled = ?",
    )
    .bind(account.0)
    .bind(expected_last_reconciled)
    .execute(&mut **tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(missing_or_conflict(tx, account).await);
    }
    Ok(())
}

async fn missing_or_conflict(tx: &mut Transaction<'_, Sqlite>, account: AccountId) -> StoreError {
    let exists = sqlx::query("SELECT 1 FROM accounts WHERE account_id = ?")
        .bind(account.0)
        .fetch_optional(&mut **tx)
        .await;
    match exists {
        Ok(Some(_)) => StoreError::Conflict(account),
        Ok(None) => StoreError::AccountNotFound(account),
        Err(e) => StoreError::Backend(e),
    }
}

/// Replace the balance if it still equals `expected`. Compared numerically, so
/// `"5"` and `"5.00"` match.
async fn swap_balance(
    tx: &mut Transaction<'_, Sqlite>,
    account: AccountId,
    expected: Decimal,
    new_balance: Decimal,
) -> Result<(), StoreError> {
    let stored: String = sqlx::query("SELECT balance FROM accounts WHERE account_id = ?")
        .bind(account.0)
        .fetch_one(&mut **tx)
        .await?
        .try_get("balance")?;
    if decimal_from_text("balance", &stored)? != expected {
        return Err(StoreError::Conflict(account));
    }
    sqlx::query("UPDATE accounts SET balance = ? WHERE account_id = ?")
        .bind(decimal_to_text(new_balance))
        .bind(account.0)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Insert a fresh worker built from `archetype`.
async fn insert_worker_row(
    tx: &mut Transaction<'_, Sqlite>,
    account: AccountId,
    archetype: &Archetype,
) -> Result<Worker, StoreError> {
    // Build the row from the same defaults a new worker gets in memory.
    let template = Worker::from_archetype(WorkerId(0), account, archetype);
    let res = sqlx::query(
        "INSERT INTO workers(account_id, name, rarity, income, popularity, fans, stamina, \
         working, level, experience) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(account.0)
    .bind(&template.name)
    .bind(template.rarity.code())
    .bind(decimal_to_text(template.income))
    .bind(decimal_to_text(template.popularity))
    .bind(decimal_to_text(template.fans))
    .bind(decimal_to_text(template.stamina))
    .bind(i64::from(template.activity.is_active()))
    .bind(i64::from(template.level))
    .bind(experience_to_text(&template.experience))
    .execute(&mut **tx)
    .await;
    match res {
        Ok(res) => Ok(Worker {
            id: WorkerId(res.last_insert_rowid()),
            ..template
        }),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Err(StoreError::DuplicateWorker {
                account,
                name: archetype.name.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

impl AccountStore for SqliteStore {
    async fn load_snapshot(
        &self,
        account: AccountId,
    ) -> Result<Option<AccountSnapshot>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT balance, last_reconciled, starter_claimed FROM accounts WHERE account_id = ?",
        )
        .bind(account.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let account_row = Account {
            id: account,
            balance: decimal_from_text("balance", row.try_get("balance")?)?,
            last_reconciled: row.try_get("last_reconciled")?,
            starter_claimed: row.try_get::<i64, _>("starter_claimed")? != 0,
        };
        let rows = sqlx::query(
            "SELECT worker_id, account_id, name, rarity, income, popularity, fans, stamina, \
             working, level, experience FROM workers WHERE account_id = ? ORDER BY worker_id",
        )
        .bind(account.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        let workers = rows
            .iter()
            .map(worker_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(AccountSnapshot {
            account: account_row,
            workers,
        }))
    }

    async fn commit_reconciliation(
        &self,
        account: AccountId,
        commit: Commit<'_>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let res = sqlx::query(
            "UPDATE accounts SET balance = ?, last_reconciled = ? \
             WHERE account_id = ? AND last_reconciled = ?",
        )
        .bind(decimal_to_text(commit.new_balance))
        .bind(commit.new_last_reconciled)
        .bind(account.0)
        .bind(commit.expected_last_reconciled)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            let err = missing_or_conflict(&mut tx, account).await;
            tx.rollback().await?;
            if matches!(err, StoreError::Conflict(_)) {
                warn!(account = account.0, "reconciliation commit lost a race");
            }
            return Err(err);
        }
        for u in commit.updates {
            let res = sqlx::query(
                "UPDATE workers SET stamina = ?, working = ?, fans = ?, experience = ?, \
                 level = ?, income = ? WHERE worker_id = ? AND account_id = ?",
            )
            .bind(decimal_to_text(u.stamina))
            .bind(i64::from(u.activity.is_active()))
            .bind(decimal_to_text(u.fans))
            .bind(experience_to_text(&u.experience))
            .bind(i64::from(u.level))
            .bind(decimal_to_text(u.income))
            .bind(u.id.0)
            .bind(account.0)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(StoreError::WorkerNotFound {
                    account,
                    worker: u.id,
                });
            }
        }
        tx.commit().await?;
        debug!(
            account = account.0,
            workers = commit.updates.len(),
            last_reconciled = commit.new_last_reconciled,
            "reconciliation committed"
        );
        Ok(())
    }

    async fn create_account(&self, account: AccountId, now: i64) -> Result<bool, StoreError> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO accounts(account_id, balance, last_reconciled) \
             VALUES (?, '0', ?)",
        )
        .bind(account.0)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn insert_worker(
        &self,
        account: AccountId,
        archetype: &Archetype,
        expected_last_reconciled: i64,
    ) -> Result<Worker, StoreError> {
        let mut tx = self.pool.begin().await?;
        guard(&mut tx, account, expected_last_reconciled).await?;
        let worker = insert_worker_row(&mut tx, account, archetype).await?;
        tx.commit().await?;
        Ok(worker)
    }

    async fn set_activity(
        &self,
        account: AccountId,
        worker: WorkerId,
        activity: Activity,
        expected_last_reconciled: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        guard(&mut tx, account, expected_last_reconciled).await?;
        let res =
            sqlx::query("UPDATE workers SET working = ? WHERE worker_id = ? AND account_id = ?")
                .bind(i64::from(activity.is_active()))
                .bind(worker.0)
                .bind(account.0)
                .execute(&mut *tx)
                .await?;
        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::WorkerNotFound { account, worker });
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_balance(
        &self,
        account: AccountId,
        expected_last_reconciled: i64,
        expected_balance: Decimal,
        new_balance: Decimal,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        guard(&mut tx, account, expected_last_reconciled).await?;
        swap_balance(&mut tx, account, expected_balance, new_balance).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        guard(&mut tx, account, expected_last_reconciled).await?;
        swap_balance(&mut tx, account, expected_balance, new_balance).await?;
        let worker = insert_worker_row(&mut tx, account, archetype).await?;
        tx.commit().await?;
        Ok(worker)
    }

    async fn claim_starter(
        &self,
        account: AccountId,
        grant: &StarterGrant,
        expected_last_reconciled: i64,
    ) -> Result<Option<Worker>, StoreError> {
        let mut tx = self.pool.begin().await?;
        guard(&mut tx, account, expected_last_reconciled).await?;
        let row = sqlx::query(
            "SELECT a.balance, a.starter_claimed, \
             (SELECT COUNT(*) FROM workers w WHERE w.account_id = a.account_id) AS roster \
             FROM accounts a WHERE a.account_id = ?",
        )
        .bind(account.0)
        .fetch_one(&mut *tx)
        .await?;
        let claimed = row.try_get::<i64, _>("starter_claimed")? != 0;
        let roster: i64 = row.try_get("roster")?;
        let balance = decimal_from_text("balance", row.try_get("balance")?)?;

        sqlx::query("UPDATE accounts SET starter_claimed = 1 WHERE account_id = ?")
            .bind(account.0)
            .execute(&mut *tx)
            .await?;
        if claimed || roster > 0 {
            tx.commit().await?;
            return Ok(None);
        }
        let new_balance = balance
            .checked_add(grant.bonus)
            .ok_or_else(|| StoreError::Corrupt(format!("balance {balance} overflows")))?;
        swap_balance(&mut tx, account, balance, new_balance).await?;
        let worker = insert_worker_row(&mut tx, account, &grant.worker).await?;
        tx.commit().await?;
        info!(account = account.0, worker = worker.id.0, "starter grant claimed");
        Ok(Some(worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agency_core::WorkerUpdate;
    use bigdecimal::BigDecimal;

    fn archetype(name: &str) -> Archetype {
        Archetype {
            name: name.to_string(),
            rarity: Rarity::SSR,
            income: Decimal::new(125, 2),
            popularity: Decimal::new(3, 0),
        }
    }

    #[tokio::test]
    async fn missing_account_loads_none() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_snapshot(AccountId(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.create_account(AccountId(1), 100).await.unwrap());
        assert!(!store.create_account(AccountId(1), 999).await.unwrap());
        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(snap.account.last_reconciled, 100);
        assert_eq!(snap.account.balance, Decimal::ZERO);
        assert!(!snap.account.starter_claimed);
        assert!(snap.workers.is_empty());
    }

    #[tokio::test]
    async fn worker_roundtrip_and_duplicate_name() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_account(AccountId(1), 100).await.unwrap();
        let w = store
            .insert_worker(AccountId(1), &archetype("Mika"), 100)
            .await
            .unwrap();
        assert!(w.id.0 > 0);
        let err = store
            .insert_worker(AccountId(1), &archetype("Mika"), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateWorker { .. }));
        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(snap.workers, vec![w]);
        assert_eq!(snap.workers[0].rarity, Rarity::SSR);
    }

    #[tokio::test]
    async fn commit_is_guarded_on_watermark() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_account(AccountId(1), 100).await.unwrap();
        let w = store
            .insert_worker(AccountId(1), &archetype("Rin"), 100)
            .await
            .unwrap();
        let mut huge = BigDecimal::from(10);
        for _ in 0..3000 {
            huge = &huge + &huge;
        }
        let updates = vec![WorkerUpdate {
            id: w.id,
            stamina: Decimal::new(83_333, 3),
            activity: Activity::Resting,
            fans: Decimal::new(25, 1),
            experience: huge.clone(),
            level: 42,
            income: Decimal::new(131_250, 5),
        }];
        let commit = Commit {
            expected_last_reconciled: 100,
            new_balance: Decimal::new(5_015_625, 5),
            new_last_reconciled: 160,
            updates: &updates,
        };
        store
            .commit_reconciliation(AccountId(1), commit)
            .await
            .unwrap();

        // Replaying the same commit must not land twice.
        let err = store
            .commit_reconciliation(AccountId(1), commit)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(AccountId(1))));

        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(snap.account.last_reconciled, 160);
        assert_eq!(snap.account.balance, Decimal::new(5_015_625, 5));
        assert_eq!(snap.workers[0].to_update(), updates[0]);
        assert_eq!(snap.workers[0].experience, huge);
    }

    #[tokio::test]
    async fn failed_worker_update_rolls_back_account() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_account(AccountId(1), 100).await.unwrap();
        let updates = vec![WorkerUpdate {
            id: WorkerId(999),
            stamina: Decimal::ONE,
            activity: Activity::Active,
            fans: Decimal::ZERO,
            experience: BigDecimal::from(0),
            level: 1,
            income: Decimal::ONE,
        }];
        let commit = Commit {
            expected_last_reconciled: 100,
            new_balance: Decimal::new(7, 0),
            new_last_reconciled: 200,
            updates: &updates,
        };
        let err = store
            .commit_reconciliation(AccountId(1), commit)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkerNotFound { .. }));
        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(snap.account.last_reconciled, 100);
        assert_eq!(snap.account.balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn activity_and_balance_writes() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_account(AccountId(1), 100).await.unwrap();
        let w = store
            .insert_worker(AccountId(1), &archetype("Yui"), 100)
            .await
            .unwrap();
        store
            .set_activity(AccountId(1), w.id, Activity::Resting, 100)
            .await
            .unwrap();
        let err = store
            .set_activity(AccountId(1), WorkerId(77), Activity::Resting, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WorkerNotFound { .. }));
        let err = store
            .set_activity(AccountId(1), w.id, Activity::Active, 99)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store
            .set_balance(AccountId(1), 100, Decimal::ZERO, Decimal::new(250, 0))
            .await
            .unwrap();
        let err = store
            .set_balance(AccountId(1), 100, Decimal::ZERO, Decimal::ONE)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = store
            .set_balance(AccountId(2), 100, Decimal::ZERO, Decimal::ONE)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AccountNotFound(AccountId(2))));

        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(snap.account.balance, Decimal::new(250, 0));
        assert_eq!(snap.workers[0].activity, Activity::Resting);
    }

    #[tokio::test]
    async fn purchase_is_all_or_nothing() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_account(AccountId(1), 100).await.unwrap();
        store
            .set_balance(AccountId(1), 100, Decimal::ZERO, Decimal::new(900, 0))
            .await
            .unwrap();
        let w = store
            .purchase_worker(
                AccountId(1),
                &archetype("Eri"),
                100,
                Decimal::new(900, 0),
                Decimal::new(400, 0),
            )
            .await
            .unwrap();
        let err = store
            .purchase_worker(
                AccountId(1),
                &archetype("Eri"),
                100,
                Decimal::new(400, 0),
                Decimal::ZERO,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateWorker { .. }));
        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert_eq!(snap.account.balance, Decimal::new(400, 0));
        assert_eq!(snap.workers, vec![w]);
    }

    #[tokio::test]
    async fn starter_is_claimed_once() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.create_account(AccountId(1), 100).await.unwrap();
        let grant = StarterGrant::default();
        let w = store
            .claim_starter(AccountId(1), &grant, 100)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.name, "Aya");
        assert!(store
            .claim_starter(AccountId(1), &grant, 100)
            .await
            .unwrap()
            .is_none());
        let snap = store.load_snapshot(AccountId(1)).await.unwrap().unwrap();
        assert!(snap.account.starter_claimed);
        assert_eq!(snap.account.balance, Decimal::new(1000, 0));
        assert_eq!(snap.workers.len(), 1);
    }
}
