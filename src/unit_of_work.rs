use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use sqlx::postgres::{PgQueryResult, PgRow, PgStatement};
use sqlx::{PgPool, Postgres, Transaction};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    Context, DatabaseHandle, Executor, Handle, PgQuery, Phase, TransactionAware, TransactionError,
    TransactionResult, TxOptions,
};

/// Where a unit of work is in its finalize lifecycle.
///
/// `Committed` and `RolledBack` record which finalizer ran first, whether or
/// not the store accepted it; the outcome itself is replayed by later calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeState {
    NotFinalized,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Commit,
    Rollback,
}

impl Finish {
    fn state(self) -> FinalizeState {
        match self {
            Finish::Commit => FinalizeState::Committed,
            Finish::Rollback => FinalizeState::RolledBack,
        }
    }
}

#[derive(Debug, Clone)]
struct Finalization {
    state: FinalizeState,
    outcome: TransactionResult<()>,
}

struct Shared {
    handle: DatabaseHandle,
    finalized: OnceCell<Finalization>,
    observers: RwLock<Vec<Arc<dyn TransactionAware>>>,
}

/// Unit of Work coordinating one transaction's begin/commit/rollback lifecycle.
///
/// A unit over a pooled handle begins transactions; a unit over a
/// transaction handle finalizes it exactly once. Clones share the same state,
/// so a commit through one clone is seen by a deferred rollback through another.
///
/// ```rust,ignore
/// let uow = UnitOfWork::new(pool);
/// let two: i32 = uow
///     .run_atomic(|tx| async move {
///         let row = tx.fetch_one(&Context::background(), sqlx::query("SELECT 1 + 1")).await?;
///         Ok::<_, TransactionError>(row.get(0))
///     })
///     .await?;
/// ```
#[derive(Clone)]
pub struct UnitOfWork {
    shared: Arc<Shared>,
}

impl UnitOfWork {
    /// Creates a unit of work over a pool or an already-open transaction.
    pub fn new(handle: impl Into<DatabaseHandle>) -> Self {
        Self {
            shared: Arc::new(Shared {
                handle: handle.into(),
                finalized: OnceCell::new(),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Classifies a type-erased handle, accepting a `PgPool` or a
    /// `sqlx::Transaction<'static, Postgres>`.
    pub fn try_from_any(handle: Box<dyn Any + Send>) -> TransactionResult<Self> {
        let handle = match handle.downcast::<PgPool>() {
            Ok(pool) => return Ok(Self::new(*pool)),
            Err(other) => other,
        };
        match handle.downcast::<Transaction<'static, Postgres>>() {
            Ok(tx) => Ok(Self::new(*tx)),
            Err(other) => Err(TransactionError::UnknownHandleType(format!(
                "{:?}",
                (*other).type_id()
            ))),
        }
    }

    pub fn handle(&self) -> &DatabaseHandle {
        &self.shared.handle
    }

    pub fn is_transaction(&self) -> bool {
        self.shared.handle.is_transaction()
    }

    pub fn finalize_state(&self) -> FinalizeState {
        self.shared
            .finalized
            .get()
            .map_or(FinalizeState::NotFinalized, |finalization| finalization.state)
    }

    /// Register a component to be notified when this unit's transaction is finalized.
    pub fn register_transaction_aware(&self, observer: Arc<dyn TransactionAware>) {
        self.shared.observers.write().push(observer);
    }

    /// Begins a transaction with the server's default options.
    pub async fn begin(&self) -> TransactionResult<UnitOfWork> {
        self.begin_with_options(&Context::background(), TxOptions::default())
            .await
    }

    /// Begins a transaction and returns a new unit of work wrapping it.
    ///
    /// Fails with [`TransactionError::NestedTransaction`] when called on a
    /// unit that is already a transaction.
    pub async fn begin_with_options(
        &self,
        ctx: &Context,
        options: TxOptions,
    ) -> TransactionResult<UnitOfWork> {
        let pool = match &self.shared.handle {
            DatabaseHandle::Pooled(pool) => pool,
            DatabaseHandle::Transaction(_) => return Err(TransactionError::NestedTransaction),
        };

        let mut tx = ctx.run(Phase::Begin, pool.begin()).await?;
        if let Some(sql) = options.set_transaction_sql() {
            ctx.run(Phase::Begin, sqlx::query(&sql).execute(&mut *tx))
                .await?;
        }
        let pid: i32 = ctx
            .run(
                Phase::Begin,
                sqlx::query_scalar("SELECT pg_backend_pid()").fetch_one(&mut *tx),
            )
            .await?;

        debug!(?options, pid, "transaction started");
        Ok(UnitOfWork::new(Executor::with_backend(tx, pool.clone(), pid)))
    }

    /// Commits the transaction. A no-op on pooled units.
    pub async fn commit(&self) -> TransactionResult<()> {
        self.finalize(Finish::Commit).await
    }

    /// Rolls the transaction back. A no-op on pooled units, and after a commit.
    pub async fn rollback(&self) -> TransactionResult<()> {
        self.finalize(Finish::Rollback).await
    }

    /// Finalizes on a detached task, so the outcome is recorded even when the
    /// calling future is dropped after the transaction was taken.
    async fn finalize(&self, finish: Finish) -> TransactionResult<()> {
        if !self.is_transaction() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        match tokio::spawn(async move { shared.finalize(finish).await }).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => {
                warn!(error = %err, "finalize task did not complete");
                Err(TransactionError::Finalized)
            }
        }
    }

    async fn rollback_after_failure(&self) {
        if let Err(err) = self.rollback().await {
            warn!(error = %err, "rollback after failed unit of work");
        }
    }

    /// Runs `work` in a new transaction with default options.
    ///
    /// See [`run_atomic_with`](Self::run_atomic_with).
    pub async fn run_atomic<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        self.run_atomic_with(&Context::background(), TxOptions::default(), work)
            .await
    }

    /// Begins a transaction, runs `work` with it and commits if `work` succeeds.
    ///
    /// The first error wins: begin, then `work`, then commit. If `work` fails
    /// or panics the transaction is rolled back before the error is returned
    /// or the panic resumes.
    pub async fn run_atomic_with<F, Fut, T, E>(
        &self,
        ctx: &Context,
        options: TxOptions,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        let uow = self.begin_with_options(ctx, options).await?;
        let worker = uow.clone();

        match AssertUnwindSafe(async move { work(worker).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => {
                uow.commit().await?;
                Ok(value)
            }
            Ok(Err(err)) => {
                uow.rollback_after_failure().await;
                Err(err)
            }
            Err(panic) => {
                uow.rollback_after_failure().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Runs `work` in this unit's transaction, or in a new one if this unit is pooled.
    ///
    /// When joining, `work` neither commits nor rolls back; the unit that
    /// began the transaction stays responsible for finalizing it.
    pub async fn run_in_transaction<F, Fut, T, E>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(UnitOfWork) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TransactionError>,
    {
        if self.is_transaction() {
            return work(self.clone()).await;
        }
        self.run_atomic(work).await
    }
}

impl Shared {
    async fn finalize(&self, finish: Finish) -> TransactionResult<()> {
        let DatabaseHandle::Transaction(executor) = &self.handle else {
            return Ok(());
        };

        let finalization = self
            .finalized
            .get_or_init(|| async {
                let outcome = Self::finish(executor, finish).await;
                if outcome.is_ok() {
                    self.notify(finish).await;
                }
                Finalization {
                    state: finish.state(),
                    outcome,
                }
            })
            .await;

        if finalization.state != finish.state() {
            debug!(
                requested = ?finish,
                finalized = ?finalization.state,
                "transaction already finalized"
            );
        }
        finalization.outcome.clone()
    }

    async fn finish(executor: &Executor, finish: Finish) -> TransactionResult<()> {
        let tx = executor.take_transaction().await?;
        match finish {
            Finish::Commit => tx
                .commit()
                .await
                .map_err(|err| TransactionError::database(Phase::Commit, err))?,
            Finish::Rollback => tx
                .rollback()
                .await
                .map_err(|err| TransactionError::database(Phase::Rollback, err))?,
        }
        debug!(?finish, "transaction finalized");
        Ok(())
    }

    /// Observer failures are logged; the store's outcome stands.
    async fn notify(&self, finish: Finish) {
        let observers = self.observers.read().clone();
        for observer in observers.iter() {
            let notified = match finish {
                Finish::Commit => observer.on_commit().await,
                Finish::Rollback => observer.on_rollback().await,
            };
            if let Err(err) = notified {
                warn!(?finish, error = %err, "transaction observer failed");
            }
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("is_transaction", &self.is_transaction())
            .field("finalize_state", &self.finalize_state())
            .finish()
    }
}

#[async_trait]
impl Handle for UnitOfWork {
    async fn execute<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<PgQueryResult> {
        self.shared.handle.execute(ctx, query).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> TransactionResult<PgStatement<'static>> {
        self.shared.handle.prepare(ctx, sql).await
    }

    async fn fetch_all<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Vec<PgRow>> {
        self.shared.handle.fetch_all(ctx, query).await
    }

    async fn fetch_one<'q>(&self, ctx: &Context, query: PgQuery<'q>) -> TransactionResult<PgRow> {
        self.shared.handle.fetch_one(ctx, query).await
    }

    async fn fetch_optional<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Option<PgRow>> {
        self.shared.handle.fetch_optional(ctx, query).await
    }
}
