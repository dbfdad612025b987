//! Transaction-scoped advisory locks.
//!
//! Locks are taken with `pg_advisory_xact_lock` inside the unit of work's
//! transaction, so Postgres releases them when the transaction ends, however
//! it ends. There is no unlock call.

use sqlx::Row;
use std::fmt;
use std::future::Future;
use tracing::{debug, instrument};

use crate::{Context, Handle, Phase, TransactionError, TransactionResult, TxOptions, UnitOfWork};

/// Key of a contended resource in the store's advisory-lock namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey(pub i64);

impl From<i64> for LockKey {
    fn from(key: i64) -> Self {
        LockKey(key)
    }
}

impl From<i32> for LockKey {
    fn from(key: i32) -> Self {
        LockKey(i64::from(key))
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl UnitOfWork {
    /// Blocks until the advisory lock for `key` is granted to this transaction.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn advisory_lock(&self, ctx: &Context, key: LockKey) -> TransactionResult<()> {
        if !self.is_transaction() {
            return Err(TransactionError::NotInTransaction);
        }

        self.execute(ctx, sqlx::query("SELECT pg_advisory_xact_lock($1)").bind(key.0))
            .await
            .map_err(|err| err.in_phase(Phase::Lock))?;
        debug!("advisory lock acquired");
        Ok(())
    }

    /// Probes the advisory lock for `key` once, returning whether it was granted.
    #[instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn try_advisory_lock(&self, ctx: &Context, key: LockKey) -> TransactionResult<bool> {
        if !self.is_transaction() {
            return Err(TransactionError::NotInTransaction);
        }

        let row = self
            .fetch_one(ctx, sqlx::query("SELECT pg_try_advisory_xact_lock($1)").bind(key.0))
            .await
            .map_err(|err| err.in_phase(Phase::Lock))?;
        let acquired: bool = row
            .try_get(0)
            .map_err(|err| TransactionError::database(Phase::Lock, err))?;

        debug!(acquired, "advisory lock probed");
        Ok(acquired)
    }

    /// Runs `work` in a new transaction once the advisory lock for `key` is held.
    ///
    /// Callers sharing a key on the same database run one at a time. If `ctx`
    /// is cancelled or expires while waiting, the transaction is rolled back
    /// and `work` is not invoked.
    pub async fn run_with_lock<F, Fut, T, E>(
        &self,
        ctx: &Context,
        key: impl Into<LockKey>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let key = key.into();
        self.run_atomic_with(ctx, TxOptions::default(), move |uow| async move {
            uow.advisory_lock(ctx, key).await?;
            work(uow).await
        })
        .await
    }

    /// Like [`run_with_lock`](Self::run_with_lock), but fails with
    /// [`TransactionError::AlreadyLocked`] instead of waiting when another
    /// transaction holds the lock.
    pub async fn run_with_try_lock<F, Fut, T, E>(
        &self,
        ctx: &Context,
        key: impl Into<LockKey>,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let key = key.into();
        self.run_atomic_with(ctx, TxOptions::default(), move |uow| async move {
            if !uow.try_advisory_lock(ctx, key).await? {
                return Err(TransactionError::AlreadyLocked(key).into());
            }
            work(uow).await
        })
        .await
    }
}
