use chrono::{DateTime, Utc};
use sqlx::MySqlConnection;

use crate::error::StorageError;
use crate::sql::Statements;

/// Appends one counter delta. Aggregation folds these rows away later; the
/// public reading never changes.
pub(crate) async fn insert_delta<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    delta: i32,
    expire_at: Option<DateTime<Utc>>,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.counters.insert)
        .bind(key)
        .bind(delta)
        .bind(expire_at)
        .execute(executor)
        .await?;
    Ok(())
}

/// Current counter value: raw deltas plus the rolled-up total.
pub(crate) async fn get<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<i64, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    Ok(sqlx::query_scalar(&sql.counters.get)
        .bind(key)
        .bind(key)
        .fetch_one(executor)
        .await?)
}

/// Snapshot the ids of at most `count` raw rows into a session-scoped
/// memory table. Runs outside any transaction: the server refuses temporary
/// table DDL inside one when binary logging is on.
pub(crate) async fn snapshot_refs(
    conn: &mut MySqlConnection,
    sql: &Statements,
    count: u64,
) -> Result<(), StorageError> {
    let create_refs = sql.counters.create_refs.replace("{count}", &count.to_string());
    sqlx::query(&create_refs).execute(conn).await?;
    Ok(())
}

/// Fold the snapshotted rows into the aggregated table and delete them.
/// Must run inside one transaction so a crash can never double-count.
/// Returns how many raw rows were folded away; a full pass signals that
/// more work remains.
pub(crate) async fn fold_refs(
    conn: &mut MySqlConnection,
    sql: &Statements,
) -> Result<u64, StorageError> {
    sqlx::query(&sql.counters.roll_up)
        .execute(&mut *conn)
        .await?;
    let deleted = sqlx::query(&sql.counters.delete_rolled_up)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(deleted)
}

/// Tear the snapshot down so the next pass on this session starts clean.
pub(crate) async fn drop_refs(
    conn: &mut MySqlConnection,
    sql: &Statements,
) -> Result<(), StorageError> {
    sqlx::query(&sql.counters.drop_refs).execute(conn).await?;
    Ok(())
}
