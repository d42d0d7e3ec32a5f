//! Round-robin deletion of expired rows. Each expiring table is swept in
//! bounded batches under the expiration manager's global lock plus the
//! table's resource lock; a database error on one table is logged and the
//! sweep moves on to the next.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::{MySqlConnection, MySqlPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::StorageOptions;
use crate::error::StorageError;
use crate::locks::repeater::{self, Repeater};
use crate::locks::resource::Resource;
use crate::locks::session;
use crate::sql::{Statements, EXPIRING_TABLES};

const BATCH_SIZE: u64 = 1000;
const BETWEEN_BATCHES: Duration = Duration::from_secs(1);

// Resource class guarding each entry of EXPIRING_TABLES, same order.
const TABLE_RESOURCES: [Resource; 5] = [
    Resource::Counter,
    Resource::Job,
    Resource::List,
    Resource::Set,
    Resource::Hash,
];

pub struct ExpirationManager {
    pool: MySqlPool,
    sql: Arc<Statements>,
    options: Arc<StorageOptions>,
}

impl ExpirationManager {
    pub(crate) fn new(pool: MySqlPool, sql: Arc<Statements>, options: Arc<StorageOptions>) -> Self {
        Self { pool, sql, options }
    }

    /// Sweep forever. After a batch that deleted something the next one
    /// follows shortly; an empty batch backs off to the check interval.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("expiration manager started");
        loop {
            let removed_any = self.expire_once(&cancel).await;
            if cancel.is_cancelled() {
                break;
            }
            let pause = if removed_any {
                BETWEEN_BATCHES
            } else {
                self.options.job_expiration_check_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("expiration manager stopped");
    }

    /// One round over every expiring table. Returns true when any table
    /// gave up rows.
    pub async fn expire_once(&self, cancel: &CancellationToken) -> bool {
        let mut removed_any = false;
        for (index, table) in EXPIRING_TABLES.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            match self.expire_table(index, cancel).await {
                Ok(removed) => {
                    if removed > 0 {
                        debug!(table = *table, removed, "expired rows deleted");
                        metrics::counter!("flywheel_expired_rows_total", "table" => *table)
                            .increment(removed);
                        removed_any = true;
                    }
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    error!(table = *table, error = %e, "expiration sweep failed; moving to next table");
                }
            }
        }
        removed_any
    }

    async fn expire_table(
        &self,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let worker_lock = format!("{}/expiration-manager", self.sql.prefix);
        let deadline = Instant::now() + self.options.transaction_timeout;
        session::acquire(&mut conn, &worker_lock, deadline, cancel).await?;

        let result = {
            let repeater = Repeater::new(
                self.sql.prefix.clone(),
                [TABLE_RESOURCES[index]],
                self.options.transaction_timeout,
                cancel.clone(),
            );
            let statement = self.sql.expire[index].clone();
            let act = repeater::action(
                move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<u64, StorageError>> {
                    let statement = statement.clone();
                    Box::pin(async move {
                        let result = sqlx::query(&statement)
                            .bind(Utc::now())
                            .bind(BATCH_SIZE)
                            .execute(conn)
                            .await?;
                        Ok(result.rows_affected())
                    })
                },
            );
            repeater.run_one(&mut conn, &act).await
        };

        session::release(&mut conn, &worker_lock).await;
        result
    }
}
