use common::{test_options, test_storage_with, PREFIX};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

mod common;

#[sqlx::test]
async fn installer_is_idempotent(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    // Construct twice against the same database: the second run must find
    // the schema in place and every migration already recorded.
    let storage = test_storage_with(conn_opts.clone(), test_options()).await;
    let migrations_after_first: Vec<String> =
        sqlx::query_scalar(&format!("SELECT `Id` FROM `{PREFIX}Migration` ORDER BY `Id`"))
            .fetch_all(storage.pool())
            .await
            .expect("migration registry missing");
    assert!(!migrations_after_first.is_empty());
    storage.close().await;

    let storage = test_storage_with(conn_opts, test_options()).await;
    let migrations_after_second: Vec<String> =
        sqlx::query_scalar(&format!("SELECT `Id` FROM `{PREFIX}Migration` ORDER BY `Id`"))
            .fetch_all(storage.pool())
            .await
            .expect("migration registry missing");
    assert_eq!(migrations_after_first, migrations_after_second);

    // Each migration id executed exactly once.
    let distinct: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(DISTINCT `Id`) FROM `{PREFIX}Migration`"
    ))
    .fetch_one(storage.pool())
    .await
    .expect("count failed");
    assert_eq!(distinct as usize, migrations_after_second.len());
}

#[sqlx::test]
async fn two_prefixes_share_one_database(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let first = test_storage_with(conn_opts.clone(), test_options()).await;

    let mut other = test_options();
    other.tables_prefix = "other_".to_string();
    let second = test_storage_with(conn_opts, other).await;

    // Writes through one prefix must be invisible through the other.
    let mut tx = first.create_transaction();
    tx.increment_counter("stats:shared");
    tx.commit().await.expect("commit failed");

    assert_eq!(
        first
            .get_counter("stats:shared")
            .await
            .expect("read failed"),
        1
    );
    assert_eq!(
        second
            .get_counter("stats:shared")
            .await
            .expect("read failed"),
        0
    );
}
