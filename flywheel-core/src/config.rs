use std::time::Duration;

/// Transaction isolation hint applied before batch commits. Single-statement
/// paths ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub(crate) fn set_statement(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"
            }
            IsolationLevel::ReadCommitted => "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
            IsolationLevel::RepeatableRead => "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Storage-wide options. All table names and advisory-lock names are derived
/// from `tables_prefix`, so independent deployments can share one database.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Prepended to every table name and advisory-lock name.
    pub tables_prefix: String,
    /// Run the schema installer and pending migrations on construction.
    pub prepare_schema: bool,
    /// Sleep between empty dequeue attempts. Lower-clamped at 1 second.
    pub queue_poll_interval: Duration,
    /// Sleep after an expiration batch that found nothing to delete.
    pub job_expiration_check_interval: Duration,
    /// Sleep after a counters-aggregation run drains the backlog.
    pub counters_aggregate_interval: Duration,
    /// Age after which a claimed-but-unfinished queue slot becomes
    /// reclaimable by another worker.
    pub invisibility_timeout: Duration,
    /// Upper bound for a write-only transaction commit, including all lock
    /// acquisition and deadlock retries.
    pub transaction_timeout: Duration,
    /// Not interpreted by the core; handed through to monitoring surfaces.
    pub dashboard_job_list_limit: u64,
    /// Optional isolation hint for batch commits.
    pub transaction_isolation: Option<IsolationLevel>,
}

pub(crate) const MIN_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            tables_prefix: String::new(),
            prepare_schema: true,
            queue_poll_interval: Duration::from_secs(15),
            job_expiration_check_interval: Duration::from_secs(60 * 60),
            counters_aggregate_interval: Duration::from_secs(5 * 60),
            invisibility_timeout: Duration::from_secs(30 * 60),
            transaction_timeout: Duration::from_secs(60),
            dashboard_job_list_limit: 50_000,
            transaction_isolation: None,
        }
    }
}

impl StorageOptions {
    /// Effective dequeue poll interval, after clamping.
    pub(crate) fn poll_interval(&self) -> Duration {
        self.queue_poll_interval.max(MIN_QUEUE_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_is_clamped_to_one_second() {
        let options = StorageOptions {
            queue_poll_interval: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(options.poll_interval(), Duration::from_secs(1));

        let options = StorageOptions {
            queue_poll_interval: Duration::from_secs(15),
            ..Default::default()
        };
        assert_eq!(options.poll_interval(), Duration::from_secs(15));
    }
}
