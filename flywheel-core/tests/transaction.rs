use std::time::Duration;

use common::{create_job, sample_state, test_storage, PREFIX};
use flywheel_core::StorageError;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

mod common;

#[sqlx::test]
async fn set_job_state_keeps_pointer_and_name_consistent(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;
    let job_id = create_job(&storage).await;

    let mut tx = storage.create_transaction();
    tx.set_job_state(&job_id, sample_state("Enqueued"))
        .expect("failed to queue state change");
    tx.set_job_state(&job_id, sample_state("Processing"))
        .expect("failed to queue state change");
    tx.commit().await.expect("failed to commit");

    let state = storage
        .get_state_data(&job_id)
        .await
        .expect("state read failed")
        .expect("job must have a current state");
    assert_eq!(state.name, "Processing");
    assert_eq!(state.reason.as_deref(), Some("test transition"));
    assert!(state.data.contains_key("EnqueuedAt"));

    let job = storage
        .get_job_data(&job_id)
        .await
        .expect("job read failed")
        .expect("job must exist");
    assert_eq!(job.state_name.as_deref(), Some("Processing"));

    // The pointer must reference the most recent insert for the job.
    let (state_id, max_id): (Option<i64>, Option<i64>) = {
        let pointer: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT CAST(`StateId` AS SIGNED) FROM `{PREFIX}Job` WHERE `Id` = 1"
        ))
        .fetch_one(storage.pool())
        .await
        .expect("job row missing");
        let newest: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT CAST(MAX(`Id`) AS SIGNED) FROM `{PREFIX}State` WHERE `JobId` = 1"
        ))
        .fetch_one(storage.pool())
        .await
        .expect("state rows missing");
        (pointer, newest)
    };
    assert_eq!(state_id, max_id);
}

#[sqlx::test]
async fn failed_batch_leaves_no_trace(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let mut tx = storage.create_transaction();
    tx.increment_counter("stats:attempts");
    // No job with id 999 exists, so the state insert trips the foreign key
    // and must take the counter increment down with it.
    tx.set_job_state("999", sample_state("Enqueued"))
        .expect("failed to queue state change");
    tx.commit().await.expect_err("commit must fail");

    let counter = storage
        .get_counter("stats:attempts")
        .await
        .expect("counter read failed");
    assert_eq!(counter, 0, "rolled-back batch must not leak effects");
}

#[sqlx::test]
async fn expire_and_persist_job_toggle_the_expiry(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;
    let job_id = create_job(&storage).await;

    let mut tx = storage.create_transaction();
    tx.persist_job(&job_id).expect("failed to queue persist");
    tx.commit().await.expect("failed to commit");
    let expire_at: Option<chrono::DateTime<chrono::Utc>> = sqlx::query_scalar(&format!(
        "SELECT `ExpireAt` FROM `{PREFIX}Job` WHERE `Id` = 1"
    ))
    .fetch_one(storage.pool())
    .await
    .expect("job row missing");
    assert!(expire_at.is_none());

    let mut tx = storage.create_transaction();
    tx.expire_job(&job_id, Duration::from_secs(3600))
        .expect("failed to queue expire");
    tx.commit().await.expect("failed to commit");
    let expire_at: Option<chrono::DateTime<chrono::Utc>> = sqlx::query_scalar(&format!(
        "SELECT `ExpireAt` FROM `{PREFIX}Job` WHERE `Id` = 1"
    ))
    .fetch_one(storage.pool())
    .await
    .expect("job row missing");
    assert!(expire_at.is_some());
}

#[sqlx::test]
async fn list_ranges_rank_newest_first(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let mut tx = storage.create_transaction();
    for value in ["a", "b", "c", "d", "e"] {
        tx.insert_to_list("progress", value);
    }
    tx.commit().await.expect("failed to commit");

    let range = storage
        .get_range_from_list("progress", 0, 1)
        .await
        .expect("range read failed");
    assert_eq!(range, vec!["e", "d"], "list ranges run newest first");

    let everything = storage
        .get_all_items_from_list("progress")
        .await
        .expect("read failed");
    assert_eq!(everything, vec!["e", "d", "c", "b", "a"]);
}

#[sqlx::test]
async fn trim_list_keeps_the_oldest_window(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let mut tx = storage.create_transaction();
    for value in ["a", "b", "c", "d", "e"] {
        tx.insert_to_list("progress", value);
    }
    // Ranks run 1..N by insertion order; keep ranks 2..=3.
    tx.trim_list("progress", 1, 2).expect("failed to queue trim");
    tx.commit().await.expect("failed to commit");

    let remaining = storage
        .get_all_items_from_list("progress")
        .await
        .expect("read failed");
    assert_eq!(remaining, vec!["c", "b"]);
}

#[sqlx::test]
async fn set_operations_round_trip(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let mut tx = storage.create_transaction();
    tx.add_to_set_with_score("schedule", "job-1", 3.0);
    tx.add_to_set_with_score("schedule", "job-2", 1.0);
    tx.add_to_set_with_score("schedule", "job-3", 2.0);
    tx.remove_from_set("schedule", "job-3");
    // Re-adding an existing value only moves its score.
    tx.add_to_set_with_score("schedule", "job-1", 5.0);
    tx.commit().await.expect("failed to commit");

    assert_eq!(
        storage.get_set_count("schedule").await.expect("count failed"),
        2
    );
    let lowest = storage
        .get_first_by_lowest_score_from_set("schedule", 0.0, 10.0)
        .await
        .expect("score read failed");
    assert_eq!(lowest.as_deref(), Some("job-2"));

    let range = storage
        .get_range_from_set("schedule", 0, 0)
        .await
        .expect("range read failed");
    assert_eq!(range, vec!["job-1"], "set ranges run oldest first");

    let err = storage
        .get_first_by_lowest_score_from_set("schedule", 10.0, 0.0)
        .await
        .expect_err("inverted score range must fail");
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

#[sqlx::test]
async fn hash_set_range_upserts(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let mut tx = storage.create_transaction();
    tx.set_range_in_hash(
        "recurring:job-7",
        [
            ("Cron".to_string(), "0 * * * *".to_string()),
            ("Queue".to_string(), "default".to_string()),
        ],
    );
    tx.commit().await.expect("failed to commit");

    let mut tx = storage.create_transaction();
    tx.set_range_in_hash(
        "recurring:job-7",
        [("Queue".to_string(), "critical".to_string())],
    );
    tx.commit().await.expect("failed to commit");

    let entries = storage
        .get_all_entries_from_hash("recurring:job-7")
        .await
        .expect("hash read failed")
        .expect("hash must exist");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries["Queue"], "critical");
    assert_eq!(entries["Cron"], "0 * * * *");

    let mut tx = storage.create_transaction();
    tx.remove_hash("recurring:job-7");
    tx.commit().await.expect("failed to commit");
    assert!(storage
        .get_all_entries_from_hash("recurring:job-7")
        .await
        .expect("hash read failed")
        .is_none());
}

#[sqlx::test]
async fn collection_ttls_report_the_earliest_expiry(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    assert_eq!(
        storage
            .get_set_ttl("missing")
            .await
            .expect("ttl read failed")
            .num_seconds(),
        -1
    );

    let mut tx = storage.create_transaction();
    tx.add_to_set("schedule", "job-1");
    tx.expire_set("schedule", Duration::from_secs(3600))
        .expect("failed to queue expire");
    tx.commit().await.expect("failed to commit");

    let ttl = storage
        .get_set_ttl("schedule")
        .await
        .expect("ttl read failed");
    assert!(ttl.num_seconds() > 3500 && ttl.num_seconds() <= 3600);

    let mut tx = storage.create_transaction();
    tx.persist_set("schedule");
    tx.commit().await.expect("failed to commit");
    assert_eq!(
        storage
            .get_set_ttl("schedule")
            .await
            .expect("ttl read failed")
            .num_seconds(),
        -1
    );
}
