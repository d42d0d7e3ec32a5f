mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so
// we can refactor the internals without breaking the public API.

// Types
mod types;
pub use types::no_ttl;
pub use types::JobData;
pub use types::JobDescriptor;
pub use types::ServerData;
pub use types::StateRecord;

// Errors
mod error;
pub use error::StorageError;

// Config
mod config;
pub use config::IsolationLevel;
pub use config::StorageOptions;

// Pool
mod pool;
pub use pool::PoolConfig;

// Locking layer: session locks, the resource lock set, the repeater and the
// user-facing distributed lock.
mod locks;
pub use locks::distributed::DistributedLock;
pub use locks::resource::Resource;

// Statement cache and schema management
mod schema;
mod sql;

// Queue
mod providers;
mod queue;
pub use providers::QueueProvider;
pub use queue::FetchedJob;
pub use queue::JobQueue;

// Write-only transaction
mod transaction;
pub use transaction::WriteOnlyTransaction;

// Storage handle / reader surface
mod storage;
pub use storage::Storage;

// Maintenance workers
mod aggregator;
mod expiration;
pub use aggregator::CountersAggregator;
pub use expiration::ExpirationManager;
