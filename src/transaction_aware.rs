use async_trait::async_trait;

use crate::TransactionResult;

/// Trait for components that need to be notified when a transaction is finalized.
///
/// Observers registered on a transaction-backed [`UnitOfWork`](crate::UnitOfWork)
/// are notified at most once, by whichever of commit or rollback reaches the
/// store first, and only after the physical action succeeded. Later
/// commit/rollback calls replay the cached outcome without notifying again.
///
/// Observer errors are logged and do not change the finalize outcome: a
/// transaction the store committed is reported as committed.
#[async_trait]
pub trait TransactionAware: Send + Sync {
    /// Called after the transaction committed.
    async fn on_commit(&self) -> TransactionResult<()> {
        Ok(())
    }

    /// Called after the transaction rolled back, e.g. to discard in-memory state
    /// staged during the transaction.
    async fn on_rollback(&self) -> TransactionResult<()> {
        Ok(())
    }
}
