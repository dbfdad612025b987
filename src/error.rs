use std::fmt;
use std::sync::Arc;

use crate::LockKey;

/// The point in a transaction's life at which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Connect,
    Begin,
    Execute,
    Prepare,
    Query,
    Lock,
    Commit,
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connect => "connect",
            Phase::Begin => "begin",
            Phase::Execute => "execute",
            Phase::Prepare => "prepare",
            Phase::Query => "query",
            Phase::Lock => "lock",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Error type for unit of work operations.
///
/// Cloneable so that the outcome of a finalized transaction can be handed
/// back to every later commit/rollback call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionError {
    #[error("cannot nest transaction")]
    NestedTransaction,

    #[error("unknown database handle type: {0}")]
    UnknownHandleType(String),

    #[error("advisory lock {0} is already held")]
    AlreadyLocked(LockKey),

    #[error("operation requires an active transaction")]
    NotInTransaction,

    #[error("transaction already finalized")]
    Finalized,

    #[error("{phase} failed: {source}")]
    Database {
        phase: Phase,
        #[source]
        source: Arc<sqlx::Error>,
    },

    #[error("{phase} canceled")]
    Cancelled { phase: Phase },

    #[error("{phase} deadline exceeded")]
    DeadlineExceeded { phase: Phase },
}

impl TransactionError {
    pub fn database(phase: Phase, source: sqlx::Error) -> Self {
        TransactionError::Database {
            phase,
            source: Arc::new(source),
        }
    }

    /// The phase an underlying store, cancellation or deadline error was raised in.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TransactionError::Database { phase, .. }
            | TransactionError::Cancelled { phase }
            | TransactionError::DeadlineExceeded { phase } => Some(*phase),
            _ => None,
        }
    }

    /// Re-tags a phase-carrying error; other variants pass through.
    pub(crate) fn in_phase(self, phase: Phase) -> Self {
        match self {
            TransactionError::Database { source, .. } => {
                TransactionError::Database { phase, source }
            }
            TransactionError::Cancelled { .. } => TransactionError::Cancelled { phase },
            TransactionError::DeadlineExceeded { .. } => {
                TransactionError::DeadlineExceeded { phase }
            }
            other => other,
        }
    }

    pub fn is_already_locked(&self) -> bool {
        matches!(self, TransactionError::AlreadyLocked(_))
    }
}

/// Result type for unit of work operations
pub type TransactionResult<T> = Result<T, TransactionError>;
