use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::sql::Statements;

pub(crate) async fn insert<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    value: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.lists.insert)
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn remove<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    value: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.lists.remove)
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}

/// Keeps ranks `[keep_start + 1, keep_end + 1]` (1..N by `Id` ascending
/// within the key) and deletes everything else.
pub(crate) async fn trim<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    keep_start: u64,
    keep_end: u64,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.lists.trim)
        .bind(key)
        .bind(key)
        .bind(keep_start)
        .bind(keep_end - keep_start + 1)
        .execute(executor)
        .await?;
    Ok(())
}

/// Values ranked 1..N newest-first (`Id` descending); returns ranks
/// `[from + 1, to + 1]`.
pub(crate) async fn get_range<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    from: u64,
    to: u64,
) -> Result<Vec<String>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    Ok(sqlx::query_scalar(&sql.lists.get_range)
        .bind(key)
        .bind(from)
        .bind(to - from + 1)
        .fetch_all(executor)
        .await?)
}

pub(crate) async fn get_all<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<Vec<String>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    Ok(sqlx::query_scalar(&sql.lists.get_all)
        .bind(key)
        .fetch_all(executor)
        .await?)
}

pub(crate) async fn count<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let count: i64 = sqlx::query_scalar(&sql.lists.count)
        .bind(key)
        .fetch_one(executor)
        .await?;
    Ok(count as u64)
}

pub(crate) async fn expire<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    expire_at: DateTime<Utc>,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.lists.expire)
        .bind(expire_at)
        .bind(key)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn persist<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.lists.persist)
        .bind(key)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn ttl<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<Option<DateTime<Utc>>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    Ok(sqlx::query_scalar(&sql.lists.ttl)
        .bind(key)
        .fetch_one(executor)
        .await?)
}
