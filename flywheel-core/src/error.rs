use std::time::Duration;

use sqlx::mysql::MySqlDatabaseError;
use thiserror::Error;

// MySQL error numbers the server reports for retry-safe lock contention:
// ER_LOCK_DEADLOCK and XA_RBDEADLOCK.
const ER_LOCK_DEADLOCK: u16 = 1213;
const XA_RBDEADLOCK: u16 = 1614;

/// Errors surfaced by the storage core. Deadlocks never appear here directly;
/// the repeater absorbs them and only reports `Timeout` once retries are
/// exhausted, with the final deadlock chained as the source.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("operation was cancelled")]
    Cancelled,

    #[error("timed out acquiring advisory lock {name:?}")]
    LockTimeout { name: String },

    #[error("operation did not complete within {timeout:?}")]
    Timeout {
        timeout: Duration,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to decode stored payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StorageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }

    /// Tears a deadlock-class error apart from everything else, so retry
    /// loops can keep the underlying sqlx error for chaining.
    pub(crate) fn into_deadlock(self) -> Result<sqlx::Error, StorageError> {
        match self {
            StorageError::Database(e) if is_deadlock(&e) => Ok(e),
            other => Err(other),
        }
    }
}

pub(crate) fn is_deadlock(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = err else {
        return false;
    };
    db.try_downcast_ref::<MySqlDatabaseError>()
        .map(|e| matches!(e.number(), ER_LOCK_DEADLOCK | XA_RBDEADLOCK))
        .unwrap_or(false)
}
