//! Cross-process named mutual exclusion for application code. Unlike the
//! resource locks, these live on their own pooled session so the caller
//! does not have to carry one.

use std::time::{Duration, Instant};

use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlPool};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StorageError;
use crate::locks::session;

const ACQUIRE_POLL: Duration = Duration::from_millis(250);

/// A held distributed lock. `release` gives the lock back eagerly; merely
/// dropping the guard also works, because the session it rides on sheds all
/// advisory locks when it re-enters the pool.
#[derive(Debug)]
pub struct DistributedLock {
    conn: Option<PoolConnection<MySql>>,
    name: String,
}

pub(crate) async fn acquire(
    pool: &MySqlPool,
    prefix: &str,
    resource: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DistributedLock, StorageError> {
    if resource.is_empty() {
        return Err(StorageError::InvalidArgument(
            "lock resource name must not be empty".into(),
        ));
    }
    let name = format!("{prefix}/{resource}");
    let deadline = Instant::now() + timeout;

    // Fast path on a short-lived lease; if the lock is contended the lease
    // goes straight back so it is not tied up by our wait.
    {
        let mut conn = pool.acquire().await?;
        if session::try_acquire(&mut conn, &name, Duration::ZERO).await? {
            return Ok(DistributedLock {
                conn: Some(conn),
                name,
            });
        }
    }

    // Contended: park on a dedicated session and poll to the deadline.
    let mut conn = pool.acquire().await?;
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if session::try_acquire(&mut conn, &name, Duration::ZERO).await? {
            return Ok(DistributedLock {
                conn: Some(conn),
                name,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(StorageError::LockTimeout { name });
        }
        let pause = (deadline - now).min(ACQUIRE_POLL);
        tokio::select! {
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

impl DistributedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock and return the session to the pool.
    pub async fn release(mut self) {
        if let Some(mut conn) = self.conn.take() {
            session::release(&mut conn, &self.name).await;
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.conn.is_some() {
            // The pool's recycle hook runs RELEASE_ALL_LOCKS() on the way
            // back in, so the lock is freed when the lease lands.
            debug!(lock = %self.name, "distributed lock released via pool recycle");
        }
    }
}
