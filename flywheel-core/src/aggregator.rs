//! Periodic roll-up of raw counter deltas into the aggregated table, so the
//! delta table stays bounded while the public counter reading never moves.
//! One aggregator instance runs at a time per prefix, enforced through a
//! global advisory lock; passes are bounded and repeated until the backlog
//! is drained.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use sqlx::{MySqlConnection, MySqlPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::StorageOptions;
use crate::error::StorageError;
use crate::locks::repeater::{self, Repeater};
use crate::locks::resource::Resource;
use crate::locks::session;
use crate::ops;
use crate::sql::Statements;

pub(crate) const DEFAULT_PASS_SIZE: u64 = 1000;
const BETWEEN_PASSES: Duration = Duration::from_millis(500);

pub struct CountersAggregator {
    pool: MySqlPool,
    sql: Arc<Statements>,
    options: Arc<StorageOptions>,
    pass_size: u64,
}

impl CountersAggregator {
    pub(crate) fn new(pool: MySqlPool, sql: Arc<Statements>, options: Arc<StorageOptions>) -> Self {
        Self {
            pool,
            sql,
            options,
            pass_size: DEFAULT_PASS_SIZE,
        }
    }

    /// Shrink or grow the per-pass row budget.
    pub fn with_pass_size(mut self, pass_size: u64) -> Self {
        self.pass_size = pass_size.max(1);
        self
    }

    /// Drain-then-sleep forever, until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("counters aggregator started");
        loop {
            match self.drain(&cancel).await {
                Ok(folded) if folded > 0 => debug!(folded, "counter backlog folded"),
                Ok(_) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => error!(error = %e, "counters aggregation failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.counters_aggregate_interval) => {}
            }
        }
        info!("counters aggregator stopped");
    }

    /// Run passes until one comes back short, which means the raw table had
    /// fewer rows left than the pass budget. Returns the total folded.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<u64, StorageError> {
        let mut total = 0u64;
        loop {
            let folded = self.aggregate_once(cancel).await?;
            metrics::counter!("flywheel_counters_aggregated_rows_total").increment(folded);
            total += folded;
            if folded < self.pass_size {
                return Ok(total);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                _ = tokio::time::sleep(BETWEEN_PASSES) => {}
            }
        }
    }

    /// One bounded pass under the aggregator's global lock and the Counter
    /// resource lock. The id snapshot sits outside the fold transaction
    /// (temporary-table DDL cannot ride inside one on a binlogged server);
    /// the fold-and-delete itself is atomic. Returns how many raw rows were
    /// folded away.
    pub async fn aggregate_once(&self, cancel: &CancellationToken) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let worker_lock = format!("{}/counters-aggregator", self.sql.prefix);
        let deadline = Instant::now() + self.options.transaction_timeout;
        session::acquire(&mut conn, &worker_lock, deadline, cancel).await?;

        let result = self.fold_pass(&mut conn, cancel).await;

        session::release(&mut conn, &worker_lock).await;
        result
    }

    async fn fold_pass(
        &self,
        conn: &mut sqlx::pool::PoolConnection<sqlx::MySql>,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        ops::counters::snapshot_refs(conn, &self.sql, self.pass_size).await?;

        let result = {
            let repeater = Repeater::new(
                self.sql.prefix.clone(),
                [Resource::Counter],
                self.options.transaction_timeout,
                cancel.clone(),
            );
            let sql = self.sql.clone();
            let act = repeater::action(
                move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<u64, StorageError>> {
                    let sql = sql.clone();
                    Box::pin(async move { ops::counters::fold_refs(conn, &sql).await })
                },
            );
            repeater.run_many(conn, &act).await
        };

        // Always tear the snapshot down; the session goes back to the pool
        // and must not carry it into the next lease.
        if let Err(e) = ops::counters::drop_refs(conn, &self.sql).await {
            tracing::warn!(error = %e, "failed to drop counter snapshot table");
        }
        result
    }
}
