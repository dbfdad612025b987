#![allow(dead_code)]

pub mod entities;
pub mod repositories;
pub mod usecase;

pub use entities::{User, UserDevice};
pub use repositories::{FailingObserver, RecordingObserver, UserRepository};
pub use usecase::RegisterUser;

use pg_advisory_uow::PoolConfig;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connects using `DATABASE_URL`, or returns `None` so the test can be skipped
/// when no database is reachable.
pub async fn connect() -> Option<PgPool> {
    init_tracing();
    match PoolConfig::from_env().connect().await {
        Ok(pool) => Some(pool),
        Err(err) => {
            eprintln!("skipping database test: {err}");
            None
        }
    }
}

/// Connect and create the tables used by the repository tests
pub async fn setup_database() -> Option<PgPool> {
    let pool = connect().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uow_users (
            id UUID PRIMARY KEY,
            email VARCHAR(255) NOT NULL UNIQUE
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to create users table");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS uow_user_devices (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES uow_users(id),
            device_id VARCHAR(255) NOT NULL UNIQUE
        )
        "#,
    )
    .execute(&pool)
    .await
    .expect("Failed to create user devices table");

    Some(pool)
}

/// Clean up database after tests
pub async fn cleanup_database(pool: &PgPool) {
    sqlx::query("DROP TABLE IF EXISTS uow_user_devices CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop user devices table");

    sqlx::query("DROP TABLE IF EXISTS uow_users CASCADE")
        .execute(pool)
        .await
        .expect("Failed to drop users table");
}
