use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use pg_advisory_uow::{
    Context, Handle, Phase, TransactionAware, TransactionError, TransactionResult,
};

use super::entities::{User, UserDevice};

fn decode<T>(result: Result<T, sqlx::Error>) -> TransactionResult<T> {
    result.map_err(|err| TransactionError::database(Phase::Query, err))
}

/// User repository written against the handle capability only, so it runs
/// the same on a pool or inside a transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserRepository;

impl UserRepository {
    pub async fn create_user(
        &self,
        db: &impl Handle,
        ctx: &Context,
        email: &str,
    ) -> TransactionResult<User> {
        let user = User::new(email);
        db.execute(
            ctx,
            sqlx::query("INSERT INTO uow_users (id, email) VALUES ($1, $2)")
                .bind(user.id)
                .bind(user.email.clone()),
        )
        .await?;
        Ok(user)
    }

    pub async fn create_user_device(
        &self,
        db: &impl Handle,
        ctx: &Context,
        user_id: Uuid,
        device_id: &str,
    ) -> TransactionResult<UserDevice> {
        let device = UserDevice::new(user_id, device_id);
        db.execute(
            ctx,
            sqlx::query("INSERT INTO uow_user_devices (id, user_id, device_id) VALUES ($1, $2, $3)")
                .bind(device.id)
                .bind(device.user_id)
                .bind(device.device_id.clone()),
        )
        .await?;
        Ok(device)
    }

    pub async fn find_by_email(
        &self,
        db: &impl Handle,
        ctx: &Context,
        email: &str,
    ) -> TransactionResult<Option<User>> {
        let row = db
            .fetch_optional(
                ctx,
                sqlx::query("SELECT id, email FROM uow_users WHERE email = $1")
                    .bind(email.to_string()),
            )
            .await?;
        row.map(|row| user_from_row(&row)).transpose()
    }

    pub async fn devices_of(
        &self,
        db: &impl Handle,
        ctx: &Context,
        user_id: Uuid,
    ) -> TransactionResult<Vec<UserDevice>> {
        let rows = db
            .fetch_all(
                ctx,
                sqlx::query(
                    "SELECT id, user_id, device_id FROM uow_user_devices \
                     WHERE user_id = $1 ORDER BY device_id",
                )
                .bind(user_id),
            )
            .await?;
        rows.iter()
            .map(|row| -> TransactionResult<UserDevice> {
                Ok(UserDevice {
                    id: decode(row.try_get("id"))?,
                    user_id: decode(row.try_get("user_id"))?,
                    device_id: decode(row.try_get("device_id"))?,
                })
            })
            .collect()
    }

    pub async fn count(&self, db: &impl Handle, ctx: &Context) -> TransactionResult<i64> {
        let row = db
            .fetch_one(ctx, sqlx::query("SELECT COUNT(*) AS count FROM uow_users"))
            .await?;
        decode(row.try_get("count"))
    }
}

fn user_from_row(row: &PgRow) -> TransactionResult<User> {
    Ok(User {
        id: decode(row.try_get("id"))?,
        email: decode(row.try_get("email"))?,
    })
}

/// Observer counting the finalize notifications it receives.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl RecordingObserver {
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionAware for RecordingObserver {
    async fn on_commit(&self) -> TransactionResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_rollback(&self) -> TransactionResult<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observer whose commit hook always fails.
#[derive(Debug, Default)]
pub struct FailingObserver;

#[async_trait]
impl TransactionAware for FailingObserver {
    async fn on_commit(&self) -> TransactionResult<()> {
        Err(TransactionError::NotInTransaction)
    }
}
