use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Phase, TransactionError, TransactionResult};

/// Cancellable, deadline-bearing context threaded through every database call.
///
/// Cloning shares the cancellation token; `child` and the `with_*`
/// constructors derive a context that is cancelled along with its parent but
/// can also be cancelled or time out on its own.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child whose deadline is `timeout` from now, or the parent's if that is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails fast when the context is already cancelled or past its deadline.
    pub(crate) fn check(&self, phase: Phase) -> TransactionResult<()> {
        if self.token.is_cancelled() {
            return Err(TransactionError::Cancelled { phase });
        }
        if matches!(self.deadline, Some(deadline) if deadline <= Instant::now()) {
            return Err(TransactionError::DeadlineExceeded { phase });
        }
        Ok(())
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub(crate) async fn interrupted(&self, phase: Phase) -> TransactionError {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => TransactionError::Cancelled { phase },
            _ = expired => TransactionError::DeadlineExceeded { phase },
        }
    }

    /// Drives a store future until it finishes, the context is cancelled, or the deadline passes.
    ///
    /// An interrupted store future is dropped. Statements on a transaction are
    /// additionally cancelled server-side by the transaction's executor.
    pub(crate) async fn run<T, F>(&self, phase: Phase, fut: F) -> TransactionResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        self.check(phase)?;

        tokio::select! {
            biased;
            err = self.interrupted(phase) => Err(err),
            result = fut => result.map_err(|err| TransactionError::database(phase, err)),
        }
    }
}
