//! The outer storage handle: owns the pool, the per-prefix statement cache
//! and the queue provider registry, and exposes the reader surface plus the
//! entry points into the queue, the write-only transaction, the distributed
//! lock manager and the maintenance workers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::mysql::MySqlConnectOptions;
use sqlx::{MySqlConnection, MySqlPool};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::CountersAggregator;
use crate::config::StorageOptions;
use crate::error::StorageError;
use crate::expiration::ExpirationManager;
use crate::locks::distributed::{self, DistributedLock};
use crate::locks::repeater::{self, RepeatAction, Repeater};
use crate::locks::resource::Resource;
use crate::ops;
use crate::pool::PoolConfig;
use crate::providers::{QueueProvider, QueueProviders, TableQueueProvider};
use crate::queue::{FetchedJob, JobQueue};
use crate::schema;
use crate::sql::Statements;
use crate::transaction::WriteOnlyTransaction;
use crate::types::{no_ttl, parse_job_id, JobData, JobDescriptor, ServerData, StateRecord};

pub struct Storage {
    pool: MySqlPool,
    sql: Arc<Statements>,
    options: Arc<StorageOptions>,
    queue: JobQueue,
    providers: QueueProviders,
    cancel: CancellationToken,
}

impl Storage {
    /// Connect and, unless disabled, install the schema and apply pending
    /// migrations before handing the storage out.
    pub async fn connect(
        config: &PoolConfig,
        options: StorageOptions,
    ) -> Result<Self, StorageError> {
        let pool = config.connect().await?;
        Self::from_pool(pool, options).await
    }

    /// As [`connect`](Self::connect), with explicit connection options.
    pub async fn connect_with(
        config: &PoolConfig,
        connect_options: MySqlConnectOptions,
        options: StorageOptions,
    ) -> Result<Self, StorageError> {
        let pool = config.connect_with(connect_options).await?;
        Self::from_pool(pool, options).await
    }

    /// Wrap an existing pool. The pool should have been built through
    /// [`PoolConfig`], whose recycle hook sheds advisory locks when a
    /// session is returned; a bare pool will leak locks from crashed code
    /// paths until sessions close.
    pub async fn from_pool(
        pool: MySqlPool,
        options: StorageOptions,
    ) -> Result<Self, StorageError> {
        let options = Arc::new(options);
        let sql = Arc::new(Statements::new(&options.tables_prefix));
        let cancel = CancellationToken::new();

        if options.prepare_schema {
            schema::prepare(&pool, &options.tables_prefix, &cancel).await?;
        }

        let queue = JobQueue::new(pool.clone(), sql.clone(), options.clone());
        let providers = QueueProviders::new(Arc::new(TableQueueProvider::new(queue.clone())));

        Ok(Self {
            pool,
            sql,
            options,
            queue,
            providers,
            cancel,
        })
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// The table-backed queue every unrouted queue name is served by.
    pub fn job_queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Route a queue name to a non-default delivery provider.
    pub fn register_queue_provider(
        &mut self,
        queue: impl Into<String>,
        provider: Arc<dyn QueueProvider>,
    ) {
        self.providers.register(queue, provider);
    }

    pub fn create_transaction(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(
            self.pool.clone(),
            self.sql.clone(),
            self.options.clone(),
            self.cancel.child_token(),
        )
    }

    pub fn counters_aggregator(&self) -> CountersAggregator {
        CountersAggregator::new(self.pool.clone(), self.sql.clone(), self.options.clone())
    }

    pub fn expiration_manager(&self) -> ExpirationManager {
        ExpirationManager::new(self.pool.clone(), self.sql.clone(), self.options.clone())
    }

    /// Cross-process named mutual exclusion; see [`DistributedLock`].
    pub async fn acquire_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<DistributedLock, StorageError> {
        distributed::acquire(
            &self.pool,
            &self.sql.prefix,
            resource,
            timeout,
            &self.cancel,
        )
        .await
    }

    /// Cancel outstanding work and dispose the pool. Every session the
    /// distributed-lock manager and queue handles borrowed comes from this
    /// pool, so closing it retires them all.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.pool.close().await;
        info!("storage closed");
    }

    // ---- jobs ----

    /// Insert a job record born expired, plus its initial parameters, as
    /// one atomic batch. The new id is returned in its textual form, which
    /// is the job's identity everywhere outside this crate.
    pub async fn create_expired_job(
        &self,
        job: &JobDescriptor,
        parameters: &HashMap<String, String>,
        created_at: DateTime<Utc>,
        expire_in: Duration,
    ) -> Result<String, StorageError> {
        let expire_in = chrono::Duration::from_std(expire_in)
            .map_err(|_| StorageError::InvalidArgument("expiry duration out of range".into()))?;

        let sql = self.sql.clone();
        let job = job.clone();
        let parameters: Vec<(String, String)> = parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<u64, StorageError>> {
                let sql = sql.clone();
                let job = job.clone();
                let parameters = parameters.clone();
                Box::pin(async move {
                    let job_id = ops::jobs::insert_job(
                        &mut *conn,
                        &sql,
                        &job,
                        created_at,
                        created_at + expire_in,
                    )
                    .await?;
                    ops::jobs::insert_parameters(conn, &sql, job_id, &parameters).await?;
                    Ok(job_id)
                })
            },
        );

        let mut conn = self.pool.acquire().await?;
        let job_id = self
            .repeater(&[Resource::Job])
            .run_many(&mut conn, &act)
            .await?;
        Ok(job_id.to_string())
    }

    /// Claim the next job across `queues`. Every queue in the set must be
    /// served by the same provider.
    pub async fn fetch_next_job(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, StorageError> {
        let provider = self.providers.resolve(queues)?;
        provider.job_queue().dequeue(queues, cancel).await
    }

    pub async fn set_job_parameter(
        &self,
        job_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), StorageError> {
        let job_id = parse_job_id(job_id)?;
        let sql = self.sql.clone();
        let name = name.to_string();
        let value = value.to_string();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<(), StorageError>> {
                let sql = sql.clone();
                let name = name.clone();
                let value = value.clone();
                Box::pin(async move {
                    ops::jobs::set_parameter(&mut *conn, &sql, job_id, &name, &value).await
                })
            },
        );
        self.run_one(&[Resource::Job], &act).await
    }

    pub async fn get_job_parameter(
        &self,
        job_id: &str,
        name: &str,
    ) -> Result<Option<String>, StorageError> {
        let job_id = parse_job_id(job_id)?;
        let mut conn = self.pool.acquire().await?;
        ops::jobs::get_parameter(&mut *conn, &self.sql, job_id, name).await
    }

    /// Read one job record. A malformed invocation payload is reported via
    /// [`JobData::load_error`], not as an error.
    pub async fn get_job_data(&self, job_id: &str) -> Result<Option<JobData>, StorageError> {
        let job_id = parse_job_id(job_id)?;
        let mut conn = self.pool.acquire().await?;
        ops::jobs::get_data(&mut *conn, &self.sql, job_id).await
    }

    /// The job's current state, resolved through its `StateId` pointer.
    pub async fn get_state_data(&self, job_id: &str) -> Result<Option<StateRecord>, StorageError> {
        let job_id = parse_job_id(job_id)?;
        let mut conn = self.pool.acquire().await?;
        ops::states::get_current(&mut *conn, &self.sql, job_id).await
    }

    // ---- server registry ----

    pub async fn announce_server(
        &self,
        server_id: &str,
        data: &ServerData,
    ) -> Result<(), StorageError> {
        Self::require_server_id(server_id)?;
        let sql = self.sql.clone();
        let server_id = server_id.to_string();
        let data = data.clone();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<(), StorageError>> {
                let sql = sql.clone();
                let server_id = server_id.clone();
                let data = data.clone();
                Box::pin(async move {
                    ops::servers::announce(&mut *conn, &sql, &server_id, &data, Utc::now()).await
                })
            },
        );
        self.run_one(&[Resource::Server], &act).await
    }

    pub async fn server_heartbeat(&self, server_id: &str) -> Result<(), StorageError> {
        Self::require_server_id(server_id)?;
        let sql = self.sql.clone();
        let server_id = server_id.to_string();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<(), StorageError>> {
                let sql = sql.clone();
                let server_id = server_id.clone();
                Box::pin(async move {
                    ops::servers::heartbeat(&mut *conn, &sql, &server_id, Utc::now()).await
                })
            },
        );
        self.run_one(&[Resource::Server], &act).await
    }

    pub async fn remove_server(&self, server_id: &str) -> Result<(), StorageError> {
        Self::require_server_id(server_id)?;
        let sql = self.sql.clone();
        let server_id = server_id.to_string();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<(), StorageError>> {
                let sql = sql.clone();
                let server_id = server_id.clone();
                Box::pin(async move { ops::servers::remove(&mut *conn, &sql, &server_id).await })
            },
        );
        self.run_one(&[Resource::Server], &act).await
    }

    /// Drop every server whose heartbeat is older than `timeout`. Returns
    /// the number of removed registrations.
    pub async fn remove_timed_out_servers(&self, timeout: Duration) -> Result<u64, StorageError> {
        if timeout.is_zero() {
            return Err(StorageError::InvalidArgument(
                "server timeout must be positive".into(),
            ));
        }
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|_| StorageError::InvalidArgument("server timeout out of range".into()))?;
        let sql = self.sql.clone();
        let act = repeater::action(
            move |conn: &mut MySqlConnection| -> BoxFuture<'_, Result<u64, StorageError>> {
                let sql = sql.clone();
                Box::pin(async move {
                    ops::servers::remove_timed_out(&mut *conn, &sql, Utc::now() - timeout).await
                })
            },
        );
        self.run_one(&[Resource::Server], &act).await
    }

    // ---- counters, sets, lists, hashes ----

    /// The counter's public value: raw deltas plus the rolled-up total, so
    /// aggregation passes are invisible to readers.
    pub async fn get_counter(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::counters::get(&mut *conn, &self.sql, key).await
    }

    pub async fn get_set_count(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::sets::count(&mut *conn, &self.sql, key).await
    }

    pub async fn get_list_count(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::lists::count(&mut *conn, &self.sql, key).await
    }

    pub async fn get_hash_count(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::hashes::count(&mut *conn, &self.sql, key).await
    }

    pub async fn get_all_items_from_set(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::sets::get_all(&mut *conn, &self.sql, key).await
    }

    pub async fn get_all_items_from_list(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::lists::get_all(&mut *conn, &self.sql, key).await
    }

    pub async fn get_all_entries_from_hash(
        &self,
        key: &str,
    ) -> Result<Option<HashMap<String, String>>, StorageError> {
        let mut conn = self.pool.acquire().await?;
        ops::hashes::get_all(&mut *conn, &self.sql, key).await
    }

    /// Set values ranked oldest-first; returns ranks `[from + 1, to + 1]`.
    pub async fn get_range_from_set(
        &self,
        key: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<String>, StorageError> {
        Self::require_range(from, to)?;
        let mut conn = self.pool.acquire().await?;
        ops::sets::get_range(&mut *conn, &self.sql, key, from, to).await
    }

    /// List values ranked newest-first; returns ranks `[from + 1, to + 1]`.
    pub async fn get_range_from_list(
        &self,
        key: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<String>, StorageError> {
        Self::require_range(from, to)?;
        let mut conn = self.pool.acquire().await?;
        ops::lists::get_range(&mut *conn, &self.sql, key, from, to).await
    }

    /// The set value with the lowest score inside `[from_score, to_score]`.
    pub async fn get_first_by_lowest_score_from_set(
        &self,
        key: &str,
        from_score: f64,
        to_score: f64,
    ) -> Result<Option<String>, StorageError> {
        if to_score < from_score {
            return Err(StorageError::InvalidArgument(format!(
                "score range end {to_score} precedes start {from_score}"
            )));
        }
        let mut conn = self.pool.acquire().await?;
        ops::sets::first_by_lowest_score(&mut *conn, &self.sql, key, from_score, to_score).await
    }

    /// Time until the earliest expiry of the set, or `-1 s` when nothing
    /// expires.
    pub async fn get_set_ttl(&self, key: &str) -> Result<chrono::Duration, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let expires_at = ops::sets::ttl(&mut *conn, &self.sql, key).await?;
        Ok(Self::ttl_from(expires_at))
    }

    pub async fn get_list_ttl(&self, key: &str) -> Result<chrono::Duration, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let expires_at = ops::lists::ttl(&mut *conn, &self.sql, key).await?;
        Ok(Self::ttl_from(expires_at))
    }

    pub async fn get_hash_ttl(&self, key: &str) -> Result<chrono::Duration, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let expires_at = ops::hashes::ttl(&mut *conn, &self.sql, key).await?;
        Ok(Self::ttl_from(expires_at))
    }

    // ---- helpers ----

    fn repeater(&self, resources: &[Resource]) -> Repeater {
        Repeater::new(
            self.sql.prefix.clone(),
            resources.to_vec(),
            self.options.transaction_timeout,
            self.cancel.child_token(),
        )
    }

    async fn run_one<T>(
        &self,
        resources: &[Resource],
        act: &dyn RepeatAction<T>,
    ) -> Result<T, StorageError> {
        let mut conn = self.pool.acquire().await?;
        self.repeater(resources).run_one(&mut conn, act).await
    }

    fn require_server_id(server_id: &str) -> Result<(), StorageError> {
        if server_id.is_empty() {
            return Err(StorageError::InvalidArgument(
                "server id must not be empty".into(),
            ));
        }
        Ok(())
    }

    fn require_range(from: u64, to: u64) -> Result<(), StorageError> {
        if to < from {
            return Err(StorageError::InvalidArgument(format!(
                "range end {to} precedes start {from}"
            )));
        }
        Ok(())
    }

    fn ttl_from(expires_at: Option<DateTime<Utc>>) -> chrono::Duration {
        match expires_at {
            Some(at) => at - Utc::now(),
            None => no_ttl(),
        }
    }
}
