use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::error::StorageError;
use crate::sql::Statements;

pub(crate) async fn set_field<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
    field: &str,
    value: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.hashes.set_field)
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn remove<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.hashes.remove)
        .bind(key)
        .execute(executor)
        .await?;
    Ok(())
}

/// All fields of one hash, or `None` when the key has no rows at all.
pub(crate) async fn get_all<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<Option<HashMap<String, String>>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let rows = sqlx::query(&sql.hashes.get_all)
        .bind(key)
        .fetch_all(executor)
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut entries = HashMap::with_capacity(rows.len());
    for row in rows {
        entries.insert(row.try_get("Field")?, row.try_get("Value")?);
    }
    Ok(Some(entries))
}

pub(crate) async fn count<'c, E>(
    executor: E,
    sql: &Statements,
    key: &str,
) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let count: i64 = sqlx::query_scalar(&sql.hashes.count)
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
    sqlx::query(&sql.hashes.expire)
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
    sqlx::query(&sql.hashes.persist)
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
    Ok(sqlx::query_scalar(&sql.hashes.ttl)
        .bind(key)
        .fetch_one(executor)
        .await?)
}
