//! Named advisory locks on a single database session, built on the server's
//! `GET_LOCK` family. A lock belongs to the session that took it; only that
//! session can release it, which is why every caller up the stack threads
//! one connection through.

use std::time::{Duration, Instant};

use sqlx::MySqlConnection;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::StorageError;

// The server-side wait is clipped so cancellation stays responsive even
// while the database is blocking on a contended name.
const MAX_SERVER_WAIT: Duration = Duration::from_secs(1);

/// One `GET_LOCK` round trip. A zero wait makes it non-blocking.
pub(crate) async fn try_acquire(
    conn: &mut MySqlConnection,
    name: &str,
    wait: Duration,
) -> Result<bool, sqlx::Error> {
    let granted: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
        .bind(name)
        .bind(wait.as_secs_f64())
        .fetch_one(conn)
        .await?;
    // 0 means timed out, NULL means the server could not grant it.
    Ok(granted == Some(1))
}

/// Acquire `name` on this session, waiting until `deadline`. The first
/// attempt never blocks; subsequent attempts wait on the server in slices
/// of at most one second, re-checking cancellation between slices.
pub(crate) async fn acquire(
    conn: &mut MySqlConnection,
    name: &str,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), StorageError> {
    if try_acquire(conn, name, Duration::ZERO).await? {
        return Ok(());
    }

    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(StorageError::LockTimeout {
                name: name.to_string(),
            });
        }
        let wait = (deadline - now).min(MAX_SERVER_WAIT);
        if try_acquire(conn, name, wait).await? {
            return Ok(());
        }
    }
}

/// Release one named lock. Failures are logged, not propagated: the pool's
/// recycle hook clears anything left behind.
pub(crate) async fn release(conn: &mut MySqlConnection, name: &str) {
    let released: Result<Option<i64>, sqlx::Error> =
        sqlx::query_scalar("SELECT RELEASE_LOCK(?)")
            .bind(name)
            .fetch_one(conn)
            .await;
    match released {
        Ok(Some(1)) => {}
        Ok(_) => warn!(lock = name, "released an advisory lock this session did not hold"),
        Err(e) => warn!(lock = name, error = %e, "failed to release advisory lock"),
    }
}

/// Shed every advisory lock this session holds. Invoked on each session
/// returned to the pool.
pub(crate) async fn release_all(conn: &mut MySqlConnection) -> Result<(), sqlx::Error> {
    sqlx::query("DO RELEASE_ALL_LOCKS()").execute(conn).await?;
    Ok(())
}
