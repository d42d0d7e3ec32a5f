//! The retry/escalation driver every write path goes through. An action is
//! first attempted optimistically, then behind a lock-freeness probe, and
//! finally while holding the full set of declared resource locks. Deadlocks
//! reported by the server are absorbed and retried with jittered backoff;
//! only an exhausted deadline surfaces to the caller.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::{Connection, MySqlConnection};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::IsolationLevel;
use crate::error::StorageError;
use crate::locks::resource::{self, Resource};

// How many bare deadlock retries to burn before consulting the lock probe.
const BARE_DEADLOCK_BUDGET: u32 = 3;
// How many probe-guarded retries before escalating to full lock acquisition.
const TESTED_RETRIES: u32 = 3;
const MAX_BACKOFF_MS: u64 = 100;
// Resolutions that needed at least this many retries get logged; smaller
// bursts are routine and stay silent.
const NOISY_RETRIES: u32 = 3;

/// A unit of work the repeater may run any number of times against one
/// session. Implementations must be idempotent up to the transaction
/// boundary the repeater provides.
pub(crate) trait RepeatAction<T>: Send + Sync {
    fn run<'c>(&'c self, conn: &'c mut MySqlConnection) -> BoxFuture<'c, Result<T, StorageError>>;
}

impl<T, F> RepeatAction<T> for F
where
    F: for<'c> Fn(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T, StorageError>>
        + Send
        + Sync,
{
    fn run<'c>(&'c self, conn: &'c mut MySqlConnection) -> BoxFuture<'c, Result<T, StorageError>> {
        self(conn)
    }
}

/// Pins a closure to the action signature so call sites infer the
/// higher-ranked lifetime.
pub(crate) fn action<T, F>(f: F) -> F
where
    F: for<'c> Fn(&'c mut MySqlConnection) -> BoxFuture<'c, Result<T, StorageError>>
        + Send
        + Sync,
{
    f
}

/// One buffered mutation of a write-only transaction. Commands are `Fn`,
/// not `FnOnce`: the whole batch re-runs if its transaction is rolled back
/// by a deadlock.
pub(crate) type Command = Box<
    dyn for<'c> Fn(&'c mut MySqlConnection) -> BoxFuture<'c, Result<(), StorageError>>
        + Send
        + Sync,
>;

struct CommandBatch<'a> {
    commands: &'a [Command],
}

impl RepeatAction<()> for CommandBatch<'_> {
    fn run<'c>(&'c self, conn: &'c mut MySqlConnection) -> BoxFuture<'c, Result<(), StorageError>> {
        Box::pin(async move {
            for command in self.commands {
                command(&mut *conn).await?;
            }
            Ok(())
        })
    }
}

pub(crate) struct Repeater {
    prefix: String,
    resources: Vec<Resource>,
    timeout: Duration,
    cancel: CancellationToken,
    isolation: Option<IsolationLevel>,
}

impl Repeater {
    pub(crate) fn new(
        prefix: impl Into<String>,
        resources: impl Into<Vec<Resource>>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            resources: resources.into(),
            timeout,
            cancel,
            isolation: None,
        }
    }

    pub(crate) fn with_isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        self.isolation = isolation;
        self
    }

    /// Run a single-statement action, no outer transaction.
    pub(crate) async fn run_one<T>(
        &self,
        conn: &mut MySqlConnection,
        action: &dyn RepeatAction<T>,
    ) -> Result<T, StorageError> {
        self.drive(conn, action, false).await
    }

    /// Run a multi-statement action inside a transaction; committed on
    /// success, rolled back on any error.
    pub(crate) async fn run_many<T>(
        &self,
        conn: &mut MySqlConnection,
        action: &dyn RepeatAction<T>,
    ) -> Result<T, StorageError> {
        self.drive(conn, action, true).await
    }

    /// Run an ordered command list inside a transaction.
    pub(crate) async fn run_batch(
        &self,
        conn: &mut MySqlConnection,
        commands: &[Command],
    ) -> Result<(), StorageError> {
        self.run_many(conn, &CommandBatch { commands }).await
    }

    async fn drive<T>(
        &self,
        conn: &mut MySqlConnection,
        action: &dyn RepeatAction<T>,
        transactional: bool,
    ) -> Result<T, StorageError> {
        let deadline = Instant::now() + self.timeout;
        let mut retries = 0u32;
        let mut last_deadlock: Option<sqlx::Error> = None;

        // Optimistic: nothing held, ride out a short deadlock burst.
        loop {
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            match self.attempt(conn, action, transactional).await {
                Ok(value) => return Ok(self.resolved(retries, value)),
                Err(e) => last_deadlock = Some(e.into_deadlock()?),
            }
            retries += 1;
            if retries >= BARE_DEADLOCK_BUDGET || Instant::now() >= deadline {
                break;
            }
            self.backoff().await?;
        }

        // Probe-guarded: only keep retrying bare while every declared
        // resource is free or already ours.
        for _ in 0..TESTED_RETRIES {
            if Instant::now() >= deadline {
                return Err(self.timed_out(last_deadlock));
            }
            if self.cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if !resource::all_free_or_mine(conn, &self.prefix, &self.resources).await? {
                break;
            }
            self.backoff().await?;
            match self.attempt(conn, action, transactional).await {
                Ok(value) => return Ok(self.resolved(retries, value)),
                Err(e) => last_deadlock = Some(e.into_deadlock()?),
            }
            retries += 1;
        }

        // Locked: serialize against every other writer of these resources
        // and retry to the deadline.
        if Instant::now() >= deadline {
            return Err(self.timed_out(last_deadlock));
        }
        let locks =
            resource::acquire_all(conn, &self.prefix, &self.resources, deadline, &self.cancel)
                .await?;
        let result = loop {
            match self.attempt(conn, action, transactional).await {
                Ok(value) => break Ok(value),
                Err(e) => match e.into_deadlock() {
                    Ok(deadlock) => {
                        retries += 1;
                        last_deadlock = Some(deadlock);
                        if Instant::now() >= deadline {
                            break Err(self.timed_out(last_deadlock.take()));
                        }
                        if let Err(cancelled) = self.backoff().await {
                            break Err(cancelled);
                        }
                    }
                    Err(other) => break Err(other),
                },
            }
        };
        locks.release(conn).await;
        result.map(|value| self.resolved(retries, value))
    }

    async fn attempt<T>(
        &self,
        conn: &mut MySqlConnection,
        action: &dyn RepeatAction<T>,
        transactional: bool,
    ) -> Result<T, StorageError> {
        if !transactional {
            return action.run(conn).await;
        }
        if let Some(level) = self.isolation {
            sqlx::query(level.set_statement())
                .execute(&mut *conn)
                .await?;
        }
        let mut tx = conn.begin().await?;
        match action.run(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                // Roll back eagerly so a retry starts from a clean session.
                tx.rollback().await.ok();
                Err(e)
            }
        }
    }

    async fn backoff(&self) -> Result<(), StorageError> {
        let jitter = rand::thread_rng().gen_range(0..=MAX_BACKOFF_MS);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(jitter)) => Ok(()),
        }
    }

    fn resolved<T>(&self, retries: u32, value: T) -> T {
        if retries >= NOISY_RETRIES {
            debug!(
                retries,
                resources = ?self.resources,
                "operation resolved after repeated deadlocks"
            );
        }
        value
    }

    fn timed_out(&self, last_deadlock: Option<sqlx::Error>) -> StorageError {
        StorageError::Timeout {
            timeout: self.timeout,
            source: last_deadlock,
        }
    }
}
