//! The deferred write path. Every mutation is buffered as a command and
//! tagged with the resource classes it touches; `commit` then takes the
//! union of those locks once and plays the commands back, in order, inside
//! a single database transaction driven by the repeater. A batch either
//! lands whole or not at all.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::{MySqlConnection, MySqlPool};
use tokio_util::sync::CancellationToken;

use crate::config::StorageOptions;
use crate::error::StorageError;
use crate::locks::repeater::{Command, Repeater};
use crate::locks::resource::Resource;
use crate::ops;
use crate::sql::Statements;
use crate::types::{parse_job_id, StateRecord};

type CommandFuture<'c> = BoxFuture<'c, Result<(), StorageError>>;

pub struct WriteOnlyTransaction {
    pool: MySqlPool,
    sql: Arc<Statements>,
    options: Arc<StorageOptions>,
    cancel: CancellationToken,
    commands: Vec<Command>,
    resources: BTreeSet<Resource>,
}

impl WriteOnlyTransaction {
    pub(crate) fn new(
        pool: MySqlPool,
        sql: Arc<Statements>,
        options: Arc<StorageOptions>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            sql,
            options,
            cancel,
            commands: Vec::new(),
            resources: BTreeSet::new(),
        }
    }

    fn push<F>(&mut self, resources: &[Resource], command: F)
    where
        F: for<'c> Fn(&'c mut MySqlConnection) -> CommandFuture<'c> + Send + Sync + 'static,
    {
        self.resources.extend(resources.iter().copied());
        self.commands.push(Box::new(command));
    }

    fn expiry(expire_in: Duration) -> Result<chrono::Duration, StorageError> {
        chrono::Duration::from_std(expire_in)
            .map_err(|_| StorageError::InvalidArgument("expiry duration out of range".into()))
    }

    /// Schedule the job record for deletion once `expire_in` has passed.
    pub fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> Result<(), StorageError> {
        let job_id = parse_job_id(job_id)?;
        let expire_in = Self::expiry(expire_in)?;
        let sql = self.sql.clone();
        self.push(&[Resource::Job], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            Box::pin(async move {
                ops::jobs::expire(&mut *conn, &sql, job_id, Utc::now() + expire_in).await
            })
        });
        Ok(())
    }

    /// Clear the job's expiry so it survives the expiration manager.
    pub fn persist_job(&mut self, job_id: &str) -> Result<(), StorageError> {
        let job_id = parse_job_id(job_id)?;
        let sql = self.sql.clone();
        self.push(&[Resource::Job], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            Box::pin(async move { ops::jobs::persist(&mut *conn, &sql, job_id).await })
        });
        Ok(())
    }

    /// Append a state row and make it the job's current state. Both writes
    /// land in one command so `LAST_INSERT_ID()` stays on one connection.
    pub fn set_job_state(&mut self, job_id: &str, state: StateRecord) -> Result<(), StorageError> {
        let job_id = parse_job_id(job_id)?;
        let sql = self.sql.clone();
        self.push(
            &[Resource::Job, Resource::State],
            move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
                let sql = sql.clone();
                let state = state.clone();
                Box::pin(async move {
                    ops::states::set_state(conn, &sql, job_id, &state, Utc::now()).await
                })
            },
        );
        Ok(())
    }

    /// Append a state row to the history without repointing the job.
    pub fn add_job_state(&mut self, job_id: &str, state: StateRecord) -> Result<(), StorageError> {
        let job_id = parse_job_id(job_id)?;
        let sql = self.sql.clone();
        self.push(&[Resource::State], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let state = state.clone();
            Box::pin(async move {
                ops::states::add_state(&mut *conn, &sql, job_id, &state, Utc::now()).await
            })
        });
        Ok(())
    }

    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> Result<(), StorageError> {
        if queue.is_empty() {
            return Err(StorageError::InvalidArgument(
                "queue name must not be empty".into(),
            ));
        }
        let job_id = parse_job_id(job_id)?;
        let sql = self.sql.clone();
        let queue = queue.to_string();
        self.push(&[Resource::Queue], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let queue = queue.clone();
            Box::pin(async move { ops::queue::enqueue(&mut *conn, &sql, &queue, job_id).await })
        });
        Ok(())
    }

    pub fn increment_counter(&mut self, key: &str) {
        self.counter_delta(key, 1, None);
    }

    pub fn increment_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<(), StorageError> {
        self.counter_delta(key, 1, Some(Self::expiry(expire_in)?));
        Ok(())
    }

    pub fn decrement_counter(&mut self, key: &str) {
        self.counter_delta(key, -1, None);
    }

    pub fn decrement_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<(), StorageError> {
        self.counter_delta(key, -1, Some(Self::expiry(expire_in)?));
        Ok(())
    }

    fn counter_delta(&mut self, key: &str, delta: i32, expire_in: Option<chrono::Duration>) {
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::Counter], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move {
                let expire_at = expire_in.map(|ttl| Utc::now() + ttl);
                ops::counters::insert_delta(&mut *conn, &sql, &key, delta, expire_at).await
            })
        });
    }

    pub fn add_to_set(&mut self, key: &str, value: &str) {
        self.add_to_set_with_score(key, value, 0.0);
    }

    pub fn add_to_set_with_score(&mut self, key: &str, value: &str, score: f64) {
        let sql = self.sql.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move { ops::sets::add(&mut *conn, &sql, &key, &value, score).await })
        });
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move { ops::sets::remove(&mut *conn, &sql, &key, &value).await })
        });
    }

    pub fn insert_to_list(&mut self, key: &str, value: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move { ops::lists::insert(&mut *conn, &sql, &key, &value).await })
        });
    }

    pub fn remove_from_list(&mut self, key: &str, value: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        let value = value.to_string();
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            let value = value.clone();
            Box::pin(async move { ops::lists::remove(&mut *conn, &sql, &key, &value).await })
        });
    }

    /// Keep list ranks `[keep_start + 1, keep_end + 1]` (oldest first) and
    /// drop everything outside the window.
    pub fn trim_list(
        &mut self,
        key: &str,
        keep_start: u64,
        keep_end: u64,
    ) -> Result<(), StorageError> {
        if keep_end < keep_start {
            return Err(StorageError::InvalidArgument(format!(
                "trim range end {keep_end} precedes start {keep_start}"
            )));
        }
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move {
                ops::lists::trim(&mut *conn, &sql, &key, keep_start, keep_end).await
            })
        });
        Ok(())
    }

    /// Upsert a batch of field/value pairs into one hash.
    pub fn set_range_in_hash(
        &mut self,
        key: &str,
        entries: impl IntoIterator<Item = (String, String)>,
    ) {
        let sql = self.sql.clone();
        let key = key.to_string();
        let entries: Vec<(String, String)> = entries.into_iter().collect();
        self.push(&[Resource::Hash], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            let entries = entries.clone();
            Box::pin(async move {
                for (field, value) in &entries {
                    ops::hashes::set_field(&mut *conn, &sql, &key, field, value).await?;
                }
                Ok(())
            })
        });
    }

    pub fn remove_hash(&mut self, key: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::Hash], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move { ops::hashes::remove(&mut *conn, &sql, &key).await })
        });
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<(), StorageError> {
        let expire_in = Self::expiry(expire_in)?;
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move {
                ops::sets::expire(&mut *conn, &sql, &key, Utc::now() + expire_in).await
            })
        });
        Ok(())
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<(), StorageError> {
        let expire_in = Self::expiry(expire_in)?;
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move {
                ops::lists::expire(&mut *conn, &sql, &key, Utc::now() + expire_in).await
            })
        });
        Ok(())
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<(), StorageError> {
        let expire_in = Self::expiry(expire_in)?;
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::Hash], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move {
                ops::hashes::expire(&mut *conn, &sql, &key, Utc::now() + expire_in).await
            })
        });
        Ok(())
    }

    pub fn persist_set(&mut self, key: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::Set], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move { ops::sets::persist(&mut *conn, &sql, &key).await })
        });
    }

    pub fn persist_list(&mut self, key: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::List], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move { ops::lists::persist(&mut *conn, &sql, &key).await })
        });
    }

    pub fn persist_hash(&mut self, key: &str) {
        let sql = self.sql.clone();
        let key = key.to_string();
        self.push(&[Resource::Hash], move |conn: &mut MySqlConnection| -> CommandFuture<'_> {
            let sql = sql.clone();
            let key = key.clone();
            Box::pin(async move { ops::hashes::persist(&mut *conn, &sql, &key).await })
        });
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Play the buffered commands back in insertion order, inside one
    /// database transaction, holding the union of every declared resource
    /// lock. All-or-nothing.
    pub async fn commit(self) -> Result<(), StorageError> {
        if self.commands.is_empty() {
            return Ok(());
        }
        let resources: Vec<Resource> = self.resources.iter().copied().collect();
        let mut conn = self.pool.acquire().await?;
        let repeater = Repeater::new(
            self.sql.prefix.clone(),
            resources,
            self.options.transaction_timeout,
            self.cancel.clone(),
        )
        .with_isolation(self.options.transaction_isolation);
        repeater.run_batch(&mut conn, &self.commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Statements;

    fn transaction() -> WriteOnlyTransaction {
        let pool = MySqlPool::connect_lazy("mysql://localhost/flywheel").expect("lazy pool");
        WriteOnlyTransaction::new(
            pool,
            Arc::new(Statements::new("t_")),
            Arc::new(StorageOptions::default()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn commands_accumulate_resource_tags() {
        let mut tx = transaction();
        tx.increment_counter("stats:succeeded");
        tx.add_to_queue("default", "7").unwrap();
        tx.set_job_state("7", StateRecord::default()).unwrap();
        assert_eq!(tx.len(), 3);
        let tags: Vec<Resource> = tx.resources.iter().copied().collect();
        assert_eq!(
            tags,
            vec![
                Resource::Counter,
                Resource::Job,
                Resource::Queue,
                Resource::State
            ]
        );
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_buffering() {
        let mut tx = transaction();
        assert!(tx.expire_job("not-a-number", Duration::from_secs(60)).is_err());
        assert!(tx.add_to_queue("", "1").is_err());
        assert!(tx.trim_list("progress", 5, 4).is_err());
        assert!(tx.is_empty());
    }
}
