//! Idempotent schema preparation: the base install script runs once when
//! the job table is absent, then the embedded migration list is applied
//! under the migration advisory lock so concurrent workers starting against
//! one database cannot race each other.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::{Connection, MySqlConnection, MySqlPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::locks::resource::Resource;
use crate::locks::session;

const INSTALL_SCRIPT: &str = include_str!("schema/install.sql");

// Startup can legitimately wait behind another worker running a slow
// migration, so the lock timeout is generous.
const MIGRATION_LOCK_TIMEOUT: Duration = Duration::from_secs(120);

struct Migration {
    id: &'static str,
    sql: &'static str,
}

// Append-only; ids already recorded in the migration table are skipped, so
// reordering or editing an entry after release would desynchronize
// deployments.
const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "001_queue_fetch_token_index",
        sql: include_str!("schema/migrations/001_queue_fetch_token_index.sql"),
    },
    Migration {
        id: "002_set_score_index",
        sql: include_str!("schema/migrations/002_set_score_index.sql"),
    },
    Migration {
        id: "003_expire_at_indexes",
        sql: include_str!("schema/migrations/003_expire_at_indexes.sql"),
    },
];

fn render(template: &str, prefix: &str) -> String {
    template.replace("{prefix}", prefix)
}

pub(crate) async fn prepare(
    pool: &MySqlPool,
    prefix: &str,
    cancel: &CancellationToken,
) -> Result<(), StorageError> {
    let mut conn = pool.acquire().await?;

    if !job_table_exists(&mut conn, prefix).await? {
        info!(prefix, "installing base schema");
        sqlx::raw_sql(&render(INSTALL_SCRIPT, prefix))
            .execute(&mut *conn)
            .await?;
    }

    let lock_name = Resource::Migration.lock_name(prefix);
    let deadline = Instant::now() + MIGRATION_LOCK_TIMEOUT;
    session::acquire(&mut conn, &lock_name, deadline, cancel).await?;
    let result = apply_migrations(&mut conn, prefix).await;
    session::release(&mut conn, &lock_name).await;
    result
}

async fn job_table_exists(conn: &mut MySqlConnection, prefix: &str) -> Result<bool, sqlx::Error> {
    let present: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM `information_schema`.`tables` \
         WHERE `table_schema` = DATABASE() AND `table_name` = ?",
    )
    .bind(format!("{prefix}Job"))
    .fetch_one(conn)
    .await?;
    Ok(present > 0)
}

async fn apply_migrations(
    conn: &mut MySqlConnection,
    prefix: &str,
) -> Result<(), StorageError> {
    // Databases installed before the registry existed get it here.
    sqlx::raw_sql(&render(
        "CREATE TABLE IF NOT EXISTS `{prefix}Migration` (\
         `Id` VARCHAR(120) NOT NULL, `ExecutedAt` DATETIME(6) NOT NULL, \
         PRIMARY KEY (`Id`)) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_bin",
        prefix,
    ))
    .execute(&mut *conn)
    .await?;

    let applied: HashSet<String> =
        sqlx::query_scalar(&render("SELECT `Id` FROM `{prefix}Migration`", prefix))
            .fetch_all(&mut *conn)
            .await?
            .into_iter()
            .collect();

    for migration in MIGRATIONS {
        if applied.contains(migration.id) {
            continue;
        }
        debug!(id = migration.id, "applying migration");
        let mut tx = conn.begin().await?;
        sqlx::raw_sql(&render(migration.sql, prefix))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&render(
            "INSERT INTO `{prefix}Migration` (`Id`, `ExecutedAt`) VALUES (?, ?)",
            prefix,
        ))
        .bind(migration.id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(id = migration.id, "migration applied");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_ids_are_unique_and_ordered() {
        let ids: Vec<&str> = MIGRATIONS.iter().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn templates_substitute_the_prefix_everywhere() {
        let rendered = render(INSTALL_SCRIPT, "hf_");
        assert!(!rendered.contains("{prefix}"));
        assert!(rendered.contains("`hf_Job`"));
        assert!(rendered.contains("`hf_Migration`"));
        for migration in MIGRATIONS {
            let rendered = render(migration.sql, "hf_");
            assert!(!rendered.contains("{prefix}"), "{} left a placeholder", migration.id);
        }
    }
}
