use async_trait::async_trait;
use sqlx::postgres::{PgQueryResult, PgRow, PgStatement};
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{Context, Handle, PgQuery, Phase, TransactionError, TransactionResult};

/// How long an interrupted statement gets to report back once the server was asked to cancel it.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// The server process behind a transaction's connection.
#[derive(Clone, Debug)]
struct Backend {
    pool: PgPool,
    pid: i32,
}

impl Backend {
    /// Asks the server, over a separate pooled connection, to cancel the
    /// statement the transaction's connection is running.
    async fn cancel(&self) -> bool {
        let request = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
            .bind(self.pid)
            .fetch_one(&self.pool);
        match tokio::time::timeout(CANCEL_GRACE, request).await {
            Ok(Ok(signalled)) => signalled,
            Ok(Err(err)) => {
                warn!(pid = self.pid, error = %err, "failed to cancel backend statement");
                false
            }
            Err(_) => {
                warn!(pid = self.pid, "timed out cancelling backend statement");
                false
            }
        }
    }
}

/// Executor owns an open PostgreSQL transaction on behalf of a unit of work.
///
/// Clones share the same transaction. Statements issued through the
/// executor are serialized on its connection; once the transaction has been
/// committed or rolled back every statement fails with
/// [`TransactionError::Finalized`].
///
/// When the executor knows its backend process (transactions begun by a
/// [`UnitOfWork`](crate::UnitOfWork)), an interrupted statement is cancelled
/// on the server and the connection is ready for rollback when the error is
/// returned. Transactions adopted from elsewhere only drop the client future.
#[derive(Clone, Debug)]
pub struct Executor {
    tx: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
    backend: Option<Backend>,
}

impl Executor {
    pub(crate) fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            backend: None,
        }
    }

    /// An executor whose statements can be cancelled through `pool` by backend `pid`.
    pub(crate) fn with_backend(tx: Transaction<'static, Postgres>, pool: PgPool, pid: i32) -> Self {
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            backend: Some(Backend { pool, pid }),
        }
    }

    /// Whether the transaction has not yet been handed off for commit or rollback.
    pub async fn is_open(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    /// Takes ownership of the transaction for commit or rollback.
    pub(crate) async fn take_transaction(
        &self,
    ) -> TransactionResult<Transaction<'static, Postgres>> {
        self.tx.lock().await.take().ok_or(TransactionError::Finalized)
    }

    /// Drives a statement on the transaction's connection under `ctx`.
    ///
    /// On cancellation or deadline the statement is cancelled server-side and
    /// awaited until the server gives up on it, so a blocked statement such as
    /// an advisory lock wait never outlives the context.
    async fn drive<T, F>(&self, ctx: &Context, phase: Phase, fut: F) -> TransactionResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let Some(backend) = &self.backend else {
            return ctx.run(phase, fut).await;
        };
        ctx.check(phase)?;

        tokio::pin!(fut);
        let interrupted = tokio::select! {
            biased;
            err = ctx.interrupted(phase) => err,
            result = &mut fut => {
                return result.map_err(|err| TransactionError::database(phase, err));
            }
        };

        debug!(pid = backend.pid, %phase, "cancelling interrupted statement");
        if backend.cancel().await && tokio::time::timeout(CANCEL_GRACE, &mut fut).await.is_err() {
            warn!(pid = backend.pid, "cancelled statement did not finish in time");
        }
        Err(interrupted)
    }
}

#[async_trait]
impl Handle for Executor {
    async fn execute<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<PgQueryResult> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(TransactionError::Finalized)?;
        self.drive(ctx, Phase::Execute, query.execute(&mut **tx)).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> TransactionResult<PgStatement<'static>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(TransactionError::Finalized)?;
        let statement = self
            .drive(ctx, Phase::Prepare, sqlx::Executor::prepare(&mut **tx, sql))
            .await?;
        Ok(sqlx::Statement::to_owned(&statement))
    }

    async fn fetch_all<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Vec<PgRow>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(TransactionError::Finalized)?;
        self.drive(ctx, Phase::Query, query.fetch_all(&mut **tx)).await
    }

    async fn fetch_one<'q>(&self, ctx: &Context, query: PgQuery<'q>) -> TransactionResult<PgRow> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(TransactionError::Finalized)?;
        self.drive(ctx, Phase::Query, query.fetch_one(&mut **tx)).await
    }

    async fn fetch_optional<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Option<PgRow>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or(TransactionError::Finalized)?;
        self.drive(ctx, Phase::Query, query.fetch_optional(&mut **tx)).await
    }
}
