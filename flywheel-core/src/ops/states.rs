use chrono::{DateTime, Utc};
use sqlx::{MySqlConnection, Row};

use crate::error::StorageError;
use crate::sql::Statements;
use crate::types::StateRecord;

/// Appends a state row without touching the job's current-state pointer.
pub(crate) async fn add_state<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
    state: &StateRecord,
    created_at: DateTime<Utc>,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let data = serde_json::to_string(&state.data)?;
    sqlx::query(&sql.states.insert)
        .bind(job_id)
        .bind(&state.name)
        .bind(&state.reason)
        .bind(created_at)
        .bind(data)
        .execute(executor)
        .await?;
    Ok(())
}

/// Appends a state row and repoints the job at it. Both statements ride one
/// connection: the pointer update reads `LAST_INSERT_ID()` from the insert.
pub(crate) async fn set_state(
    conn: &mut MySqlConnection,
    sql: &Statements,
    job_id: u64,
    state: &StateRecord,
    created_at: DateTime<Utc>,
) -> Result<(), StorageError> {
    add_state(&mut *conn, sql, job_id, state, created_at).await?;
    sqlx::query(&sql.states.point_job_at_last_state)
        .bind(&state.name)
        .bind(job_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// The job's current state, via its `StateId` pointer.
pub(crate) async fn get_current<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
) -> Result<Option<StateRecord>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let Some(row) = sqlx::query(&sql.states.get_for_job)
        .bind(job_id)
        .fetch_optional(executor)
        .await?
    else {
        return Ok(None);
    };

    let data: Option<String> = row.try_get("Data")?;
    let data = match data {
        Some(raw) => serde_json::from_str(&raw)?,
        None => Default::default(),
    };

    Ok(Some(StateRecord {
        name: row.try_get("Name")?,
        reason: row.try_get("Reason")?,
        data,
    }))
}
