use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::sql::Statements;
use crate::types::ServerData;

pub(crate) async fn announce<'c, E>(
    executor: E,
    sql: &Statements,
    server_id: &str,
    data: &ServerData,
    now: DateTime<Utc>,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let payload = serde_json::to_string(data)?;
    sqlx::query(&sql.servers.announce)
        .bind(server_id)
        .bind(payload)
        .bind(now)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn heartbeat<'c, E>(
    executor: E,
    sql: &Statements,
    server_id: &str,
    now: DateTime<Utc>,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.servers.heartbeat)
        .bind(now)
        .bind(server_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn remove<'c, E>(
    executor: E,
    sql: &Statements,
    server_id: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.servers.remove)
        .bind(server_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Deletes every server whose heartbeat is older than the cutoff. Returns
/// how many registrations were dropped.
pub(crate) async fn remove_timed_out<'c, E>(
    executor: E,
    sql: &Statements,
    heartbeat_cutoff: DateTime<Utc>,
) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let result = sqlx::query(&sql.servers.remove_timed_out)
        .bind(heartbeat_cutoff)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}
