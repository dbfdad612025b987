use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgQueryResult, PgRow, PgStatement};
use sqlx::{PgPool, Postgres, Transaction};

use crate::{Context, Executor, Phase, TransactionResult};

/// A Postgres statement with its bound arguments, as built by `sqlx::query`.
pub type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Statement-execution capability shared by pooled connections and active transactions.
///
/// Code written against `Handle` runs unchanged inside or outside a
/// transaction; the difference only shows at commit/rollback time.
#[async_trait]
pub trait Handle: Send + Sync {
    async fn execute<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<PgQueryResult>;

    async fn prepare(&self, ctx: &Context, sql: &str) -> TransactionResult<PgStatement<'static>>;

    async fn fetch_all<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Vec<PgRow>>;

    async fn fetch_one<'q>(&self, ctx: &Context, query: PgQuery<'q>) -> TransactionResult<PgRow>;

    async fn fetch_optional<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Option<PgRow>>;
}

#[async_trait]
impl Handle for PgPool {
    async fn execute<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<PgQueryResult> {
        ctx.run(Phase::Execute, query.execute(self)).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> TransactionResult<PgStatement<'static>> {
        let statement = ctx.run(Phase::Prepare, sqlx::Executor::prepare(self, sql)).await?;
        Ok(sqlx::Statement::to_owned(&statement))
    }

    async fn fetch_all<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Vec<PgRow>> {
        ctx.run(Phase::Query, query.fetch_all(self)).await
    }

    async fn fetch_one<'q>(&self, ctx: &Context, query: PgQuery<'q>) -> TransactionResult<PgRow> {
        ctx.run(Phase::Query, query.fetch_one(self)).await
    }

    async fn fetch_optional<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Option<PgRow>> {
        ctx.run(Phase::Query, query.fetch_optional(self)).await
    }
}

/// The database handle a unit of work runs against.
#[derive(Debug, Clone)]
pub enum DatabaseHandle {
    /// Non-transactional pool new transactions are begun from.
    Pooled(PgPool),
    /// An open transaction.
    Transaction(Executor),
}

impl DatabaseHandle {
    pub fn is_transaction(&self) -> bool {
        matches!(self, DatabaseHandle::Transaction(_))
    }
}

impl From<PgPool> for DatabaseHandle {
    fn from(pool: PgPool) -> Self {
        DatabaseHandle::Pooled(pool)
    }
}

impl From<Transaction<'static, Postgres>> for DatabaseHandle {
    fn from(tx: Transaction<'static, Postgres>) -> Self {
        DatabaseHandle::Transaction(Executor::new(tx))
    }
}

impl From<Executor> for DatabaseHandle {
    fn from(executor: Executor) -> Self {
        DatabaseHandle::Transaction(executor)
    }
}

#[async_trait]
impl Handle for DatabaseHandle {
    async fn execute<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<PgQueryResult> {
        match self {
            DatabaseHandle::Pooled(pool) => Handle::execute(pool, ctx, query).await,
            DatabaseHandle::Transaction(executor) => Handle::execute(executor, ctx, query).await,
        }
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> TransactionResult<PgStatement<'static>> {
        match self {
            DatabaseHandle::Pooled(pool) => Handle::prepare(pool, ctx, sql).await,
            DatabaseHandle::Transaction(executor) => Handle::prepare(executor, ctx, sql).await,
        }
    }

    async fn fetch_all<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Vec<PgRow>> {
        match self {
            DatabaseHandle::Pooled(pool) => Handle::fetch_all(pool, ctx, query).await,
            DatabaseHandle::Transaction(executor) => Handle::fetch_all(executor, ctx, query).await,
        }
    }

    async fn fetch_one<'q>(&self, ctx: &Context, query: PgQuery<'q>) -> TransactionResult<PgRow> {
        match self {
            DatabaseHandle::Pooled(pool) => Handle::fetch_one(pool, ctx, query).await,
            DatabaseHandle::Transaction(executor) => Handle::fetch_one(executor, ctx, query).await,
        }
    }

    async fn fetch_optional<'q>(
        &self,
        ctx: &Context,
        query: PgQuery<'q>,
    ) -> TransactionResult<Option<PgRow>> {
        match self {
            DatabaseHandle::Pooled(pool) => Handle::fetch_optional(pool, ctx, query).await,
            DatabaseHandle::Transaction(executor) => {
                Handle::fetch_optional(executor, ctx, query).await
            }
        }
    }
}
