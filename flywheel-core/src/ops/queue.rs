use chrono::{DateTime, Utc};
use sqlx::{MySqlConnection, Row};

use crate::error::StorageError;
use crate::sql::Statements;

pub(crate) async fn enqueue<'c, E>(
    executor: E,
    sql: &Statements,
    queue: &str,
    job_id: u64,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.queue.enqueue)
        .bind(job_id)
        .bind(queue)
        .execute(executor)
        .await?;
    Ok(())
}

/// Atomically claims at most one deliverable slot across the given queues:
/// a slot never fetched, or one whose claim has outlived the invisibility
/// window. Returns the number of rows claimed (0 or 1).
pub(crate) async fn claim(
    conn: &mut MySqlConnection,
    sql: &Statements,
    queues: &[&str],
    token: &str,
    now: DateTime<Utc>,
    stale_cutoff: DateTime<Utc>,
) -> Result<u64, StorageError> {
    let statement = sql.queue.claim(queues.len());
    let mut query = sqlx::query(&statement).bind(now).bind(token);
    for queue in queues {
        query = query.bind(*queue);
    }
    let result = query.bind(stale_cutoff).execute(conn).await?;
    Ok(result.rows_affected())
}

pub(crate) struct ClaimedSlot {
    pub id: u64,
    pub job_id: u64,
    pub queue: String,
}

/// Locates the slot a fresh claim just stamped. The token is correlation
/// only; the row id is the authority for every later mutation.
pub(crate) async fn fetch_by_token(
    conn: &mut MySqlConnection,
    sql: &Statements,
    token: &str,
) -> Result<Option<ClaimedSlot>, StorageError> {
    let Some(row) = sqlx::query(&sql.queue.fetch_by_token)
        .bind(token)
        .fetch_optional(conn)
        .await?
    else {
        return Ok(None);
    };
    Ok(Some(ClaimedSlot {
        id: row.try_get("Id")?,
        job_id: row.try_get("JobId")?,
        queue: row.try_get("Queue")?,
    }))
}

pub(crate) async fn remove<'c, E>(
    executor: E,
    sql: &Statements,
    slot_id: u64,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.queue.remove)
        .bind(slot_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn requeue<'c, E>(
    executor: E,
    sql: &Statements,
    slot_id: u64,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.queue.requeue)
        .bind(slot_id)
        .execute(executor)
        .await?;
    Ok(())
}
