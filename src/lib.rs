//! Postgres Unit of Work with Advisory Locks
//!
//! This crate coordinates the begin/commit/rollback lifecycle of PostgreSQL
//! transactions over a shared pool. Every transaction is finalized exactly
//! once, transactions never nest, and transaction-scoped advisory locks let
//! concurrent operations on the same resource key run one at a time.
//!
//! Business logic uses three entry points on [`UnitOfWork`]:
//! [`run_atomic`](UnitOfWork::run_atomic),
//! [`run_with_lock`](UnitOfWork::run_with_lock) and
//! [`run_with_try_lock`](UnitOfWork::run_with_try_lock), and issues
//! statements through the [`Handle`] capability.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handle;
pub mod lock;
pub mod options;
pub mod transaction_aware;
pub mod unit_of_work;

pub use config::PoolConfig;
pub use context::Context;
pub use error::{Phase, TransactionError, TransactionResult};
pub use executor::Executor;
pub use handle::{DatabaseHandle, Handle, PgQuery};
pub use lock::LockKey;
pub use options::{IsolationLevel, TxOptions};
pub use transaction_aware::TransactionAware;
pub use unit_of_work::{FinalizeState, UnitOfWork};
