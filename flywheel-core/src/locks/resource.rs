//! Multi-lock acquisition over the closed set of resource classes. Callers
//! declare which classes an operation touches; locks are always taken in
//! one global order, so two callers with overlapping sets cannot deadlock
//! on each other.

use std::time::Instant;

use sqlx::{MySqlConnection, Row};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::locks::session;

/// One advisory lock per variant, per prefix. Variants are declared in
/// lexicographic order of their tag, so sorting resources sorts the
/// resulting lock names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Counter,
    Hash,
    Job,
    List,
    Lock,
    Migration,
    Queue,
    Server,
    Set,
    State,
}

impl Resource {
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Resource::Counter => "counter",
            Resource::Hash => "hash",
            Resource::Job => "job",
            Resource::List => "list",
            Resource::Lock => "lock",
            Resource::Migration => "migration",
            Resource::Queue => "queue",
            Resource::Server => "server",
            Resource::Set => "set",
            Resource::State => "state",
        }
    }

    pub(crate) fn lock_name(self, prefix: &str) -> String {
        format!("{prefix}/{}", self.tag())
    }
}

/// The set of lock names currently held on one session. Consuming `release`
/// makes double release unrepresentable.
#[derive(Debug)]
pub(crate) struct ResourceLocks {
    names: Vec<String>,
}

/// Sorted, deduplicated lock names for a resource set.
fn lock_names(prefix: &str, resources: &[Resource]) -> Vec<String> {
    let mut sorted: Vec<Resource> = resources.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.into_iter().map(|r| r.lock_name(prefix)).collect()
}

/// Acquire every lock in the set, all under one shared deadline. Partial
/// acquisition is rolled back before the original error is rethrown.
pub(crate) async fn acquire_all(
    conn: &mut MySqlConnection,
    prefix: &str,
    resources: &[Resource],
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<ResourceLocks, StorageError> {
    let mut held: Vec<String> = Vec::with_capacity(resources.len());
    for name in lock_names(prefix, resources) {
        match session::acquire(conn, &name, deadline, cancel).await {
            Ok(()) => held.push(name),
            Err(e) => {
                for name in held.iter().rev() {
                    session::release(conn, name).await;
                }
                return Err(e);
            }
        }
    }
    Ok(ResourceLocks { names: held })
}

impl ResourceLocks {
    pub(crate) async fn release(self, conn: &mut MySqlConnection) {
        for name in self.names.iter().rev() {
            session::release(conn, name).await;
        }
    }
}

/// True iff every lock in the set is either free or already held by this
/// session. One round trip: each name folds into a
/// `COALESCE(IS_USED_LOCK(?), CONNECTION_ID()) = CONNECTION_ID()` term.
pub(crate) async fn all_free_or_mine(
    conn: &mut MySqlConnection,
    prefix: &str,
    resources: &[Resource],
) -> Result<bool, sqlx::Error> {
    let names = lock_names(prefix, resources);
    if names.is_empty() {
        return Ok(true);
    }

    let terms = vec!["(COALESCE(IS_USED_LOCK(?), CONNECTION_ID()) = CONNECTION_ID())"; names.len()]
        .join(" AND ");
    let statement = format!("SELECT ({terms}) AS `free`");
    let mut query = sqlx::query(&statement);
    for name in &names {
        query = query.bind(name);
    }
    let row = query.fetch_one(conn).await?;
    let free: i64 = row.try_get("free")?;
    Ok(free == 1)
}
