use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::sql::Statements;

pub(crate) async fn add<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    value: &str,
    score: f64,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.sets.add)
        .bind(key)
        .bind(value)
        .bind(score)
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
    sqlx::query(&sql.sets.remove)
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}

/// Values ranked 1..N by insertion (`Id` ascending); returns ranks
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
    Ok(sqlx::query_scalar(&sql.sets.get_range)
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
    Ok(sqlx::query_scalar(&sql.sets.get_all)
        .bind(key)
        .fetch_all(executor)
        .await?)
}

pub(crate) async fn first_by_lowest_score<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    from_score: f64,
    to_score: f64,
) -> Result<Option<String>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    Ok(sqlx::query_scalar(&sql.sets.first_by_lowest_score)
        .bind(key)
        .bind(from_score)
        .bind(to_score)
        .fetch_optional(executor)
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
    let count: i64 = sqlx::query_scalar(&sql.sets.count)
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
    sqlx::query(&sql.sets.expire)
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
    sqlx::query(&sql.sets.persist)
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
    Ok(sqlx::query_scalar(&sql.sets.ttl)
        .bind(key)
        .fetch_one(executor)
        .await?)
}
