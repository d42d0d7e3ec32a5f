//! Per-queue delivery providers. One deployment normally serves every queue
//! from the table-backed [`JobQueue`], but hosts can route individual
//! queues elsewhere. A single fetch can only watch queues that share one
//! provider; mixing implementations inside one claim is not supported.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;
use crate::queue::JobQueue;

pub trait QueueProvider: Send + Sync {
    fn job_queue(&self) -> &JobQueue;
}

pub(crate) struct TableQueueProvider {
    queue: JobQueue,
}

impl TableQueueProvider {
    pub(crate) fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

impl QueueProvider for TableQueueProvider {
    fn job_queue(&self) -> &JobQueue {
        &self.queue
    }
}

pub(crate) struct QueueProviders {
    default_provider: Arc<dyn QueueProvider>,
    overrides: HashMap<String, Arc<dyn QueueProvider>>,
}

impl QueueProviders {
    pub(crate) fn new(default_provider: Arc<dyn QueueProvider>) -> Self {
        Self {
            default_provider,
            overrides: HashMap::new(),
        }
    }

    pub(crate) fn register(&mut self, queue: impl Into<String>, provider: Arc<dyn QueueProvider>) {
        self.overrides.insert(queue.into(), provider);
    }

    /// The provider serving every queue in the set, or a validation error
    /// when the set spans more than one provider.
    pub(crate) fn resolve(&self, queues: &[&str]) -> Result<Arc<dyn QueueProvider>, StorageError> {
        let mut resolved: Option<Arc<dyn QueueProvider>> = None;
        for queue in queues {
            let provider = self
                .overrides
                .get(*queue)
                .unwrap_or(&self.default_provider)
                .clone();
            match &resolved {
                None => resolved = Some(provider),
                Some(current) => {
                    if !Arc::ptr_eq(current, &provider) {
                        return Err(StorageError::InvalidArgument(format!(
                            "queue {queue:?} is served by a different provider than the rest \
                             of the fetch set"
                        )));
                    }
                }
            }
        }
        resolved.ok_or_else(|| {
            StorageError::InvalidArgument("at least one queue name is required".into())
        })
    }
}
