use chrono::{DateTime, Utc};
use sqlx::{MySqlConnection, Row};

use crate::error::StorageError;
use crate::sql::Statements;
use crate::types::{JobData, JobDescriptor};

pub(crate) async fn insert_job<'c, E>(
    executor: E,
    sql: &Statements,
    job: &JobDescriptor,
    created_at: DateTime<Utc>,
    expire_at: DateTime<Utc>,
) -> Result<u64, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let result = sqlx::query(&sql.jobs.insert)
        .bind(&job.invocation_data)
        .bind(&job.arguments)
        .bind(created_at)
        .bind(expire_at)
        .execute(executor)
        .await?;
    Ok(result.last_insert_id())
}

/// Bulk-inserts the initial parameter rows of a freshly created job. Runs on
/// the same connection as the job insert so the whole creation commits as
/// one unit.
pub(crate) async fn insert_parameters(
    conn: &mut MySqlConnection,
    sql: &Statements,
    job_id: u64,
    parameters: &[(String, String)],
) -> Result<(), StorageError> {
    for (name, value) in parameters {
        sqlx::query(&sql.jobs.insert_parameter)
            .bind(job_id)
            .bind(name)
            .bind(value)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub(crate) async fn set_parameter<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
    name: &str,
    value: &str,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.jobs.set_parameter)
        .bind(job_id)
        .bind(name)
        .bind(value)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn get_parameter<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
    name: &str,
) -> Result<Option<String>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    Ok(sqlx::query_scalar(&sql.jobs.get_parameter)
        .bind(job_id)
        .bind(name)
        .fetch_optional(executor)
        .await?)
}

/// Reads one job record. A malformed invocation payload does not fail the
/// read; the parse error travels back inside the record instead.
pub(crate) async fn get_data<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
) -> Result<Option<JobData>, StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    let Some(row) = sqlx::query(&sql.jobs.get_data)
        .bind(job_id)
        .fetch_optional(executor)
        .await?
    else {
        return Ok(None);
    };

    let invocation_data: String = row.try_get("InvocationData")?;
    let (invocation, load_error) = match serde_json::from_str(&invocation_data) {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e.to_string())),
    };

    Ok(Some(JobData {
        invocation,
        arguments: row.try_get("Arguments")?,
        state_name: row.try_get("StateName")?,
        created_at: row.try_get("CreatedAt")?,
        load_error,
    }))
}

pub(crate) async fn expire<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
    expire_at: DateTime<Utc>,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.jobs.expire)
        .bind(expire_at)
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(())
}

pub(crate) async fn persist<'c, E>(
    executor: E,
    sql: &Statements,
    job_id: u64,
) -> Result<(), StorageError>
where
    E: sqlx::Executor<'c, Database = sqlx::MySql>,
{
    sqlx::query(&sql.jobs.persist)
        .bind(job_id)
        .execute(executor)
        .await?;
    Ok(())
}
