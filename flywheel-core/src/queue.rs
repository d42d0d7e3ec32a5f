//! At-least-once delivery of job ids. A dequeue claims a slot by stamping
//! it with the claim time and a fresh fetch token, then hands the caller a
//! [`FetchedJob`] bound to the claiming session. Slots whose consumer
//! disappears become deliverable again once the invisibility window lapses.

use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlConnection, MySqlPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::StorageOptions;
use crate::error::StorageError;
use crate::locks::repeater::{self, Repeater};
use crate::locks::resource::Resource;
use crate::ops;
use crate::sql::Statements;
use crate::types::parse_job_id;

#[derive(Clone)]
pub struct JobQueue {
    pool: MySqlPool,
    sql: Arc<Statements>,
    options: Arc<StorageOptions>,
}

impl JobQueue {
    pub(crate) fn new(pool: MySqlPool, sql: Arc<Statements>, options: Arc<StorageOptions>) -> Self {
        Self { pool, sql, options }
    }

    /// Makes `job_id` deliverable on `queue`.
    pub async fn enqueue(&self, queue: &str, job_id: &str) -> Result<(), StorageError> {
        if queue.is_empty() {
            return Err(StorageError::InvalidArgument(
                "queue name must not be empty".into(),
            ));
        }
        let job_id = parse_job_id(job_id)?;

        let mut conn = self.pool.acquire().await?;
        let repeater = Repeater::new(
            self.sql.prefix.clone(),
            [Resource::Queue],
            self.options.transaction_timeout,
            CancellationToken::new(),
        );
        let sql = self.sql.clone();
        let queue = queue.to_string();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<(), StorageError>> {
                let sql = sql.clone();
                let queue = queue.clone();
                Box::pin(async move { ops::queue::enqueue(&mut *conn, &sql, &queue, job_id).await })
            },
        );
        repeater.run_one(&mut conn, &act).await
    }

    /// Claims the next deliverable slot across `queues`, polling until one
    /// appears or `cancel` fires. The returned handle owns the claiming
    /// session; dropping it without a verdict requeues the slot.
    pub async fn dequeue(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, StorageError> {
        if queues.is_empty() {
            return Err(StorageError::InvalidArgument(
                "at least one queue name is required".into(),
            ));
        }
        let invisibility = chrono::Duration::from_std(self.options.invisibility_timeout)
            .map_err(|_| {
                StorageError::InvalidArgument("invisibility timeout out of range".into())
            })?;
        let poll = self.options.poll_interval();

        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let token = Uuid::new_v4().to_string();
            let mut conn = self.pool.acquire().await?;
            let claimed = self.claim_once(&mut conn, queues, &token, invisibility, cancel).await;

            match claimed {
                Ok(0) => {}
                Ok(_) => {
                    match ops::queue::fetch_by_token(&mut conn, &self.sql, &token).await? {
                        Some(slot) => {
                            debug!(job_id = slot.job_id, queue = %slot.queue, "claimed queue slot");
                            return Ok(FetchedJob {
                                conn: Some(conn),
                                sql: self.sql.clone(),
                                slot_id: slot.id,
                                job_id: slot.job_id.to_string(),
                                queue: slot.queue,
                                settled: false,
                            });
                        }
                        None => {
                            // The claim reported a row but the token finds
                            // nothing: only possible if the slot was deleted
                            // out from under us. Treat as an empty poll.
                            warn!("claimed slot vanished before token lookup");
                        }
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(error = %e, "dequeue failed");
                    return Err(e);
                }
            }

            // Give the session back while we sleep.
            drop(conn);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    async fn claim_once(
        &self,
        conn: &mut MySqlConnection,
        queues: &[&str],
        token: &str,
        invisibility: chrono::Duration,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        let repeater = Repeater::new(
            self.sql.prefix.clone(),
            [Resource::Queue],
            self.options.transaction_timeout,
            cancel.clone(),
        );
        let sql = self.sql.clone();
        let token = token.to_string();
        let queues: Vec<String> = queues.iter().map(|q| q.to_string()).collect();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<u64, StorageError>> {
                let sql = sql.clone();
                let token = token.clone();
                let queues = queues.clone();
                Box::pin(async move {
                    let now = Utc::now();
                    let refs: Vec<&str> = queues.iter().map(String::as_str).collect();
                    ops::queue::claim(conn, &sql, &refs, &token, now, now - invisibility).await
                })
            },
        );
        repeater.run_one(conn, &act).await
    }
}

/// A claimed queue slot, bound to the session that claimed it. Exactly one
/// of [`remove_from_queue`](Self::remove_from_queue) or
/// [`requeue`](Self::requeue) settles it; an unsettled handle requeues
/// itself when dropped.
#[derive(Debug)]
pub struct FetchedJob {
    conn: Option<PoolConnection<MySql>>,
    sql: Arc<Statements>,
    slot_id: u64,
    job_id: String,
    queue: String,
    settled: bool,
}

impl FetchedJob {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The job is done with this queue; delete its slot.
    pub async fn remove_from_queue(&mut self) -> Result<(), StorageError> {
        let sql = self.sql.clone();
        let slot_id = self.slot_id;
        let conn = self.conn_mut()?;
        ops::queue::remove(&mut **conn, &sql, slot_id).await?;
        self.settled = true;
        Ok(())
    }

    /// Hand the slot back for another delivery attempt.
    pub async fn requeue(&mut self) -> Result<(), StorageError> {
        let sql = self.sql.clone();
        let slot_id = self.slot_id;
        let conn = self.conn_mut()?;
        ops::queue::requeue(&mut **conn, &sql, slot_id).await?;
        self.settled = true;
        Ok(())
    }

    /// Settles the handle (requeueing if no verdict was given) and returns
    /// the session to the pool.
    pub async fn dispose(mut self) -> Result<(), StorageError> {
        if !self.settled {
            self.requeue().await?;
        }
        self.conn.take();
        Ok(())
    }

    fn conn_mut(&mut self) -> Result<&mut PoolConnection<MySql>, StorageError> {
        self.conn.as_mut().ok_or_else(|| {
            StorageError::InvalidArgument("fetched job was already disposed".into())
        })
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let statement = self.sql.queue.requeue.clone();
        let slot_id = self.slot_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sqlx::query(&statement).bind(slot_id).execute(&mut *conn).await
                    {
                        warn!(slot_id, error = %e, "failed to requeue dropped job");
                    }
                });
            }
            Err(_) => {
                // No runtime left to run the requeue on; the slot comes back
                // by itself once the invisibility window lapses.
                warn!(slot_id, "fetched job dropped outside a runtime");
            }
        }
    }
}
