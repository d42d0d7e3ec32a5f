use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use common::{create_job, sample_job, test_storage};
use flywheel_core::{JobDescriptor, ServerData, StorageError};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};

mod common;

#[sqlx::test]
async fn created_jobs_come_back_with_their_parameters(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let parameters = HashMap::from([
        ("CurrentCulture".to_string(), "en-US".to_string()),
        ("RetryCount".to_string(), "0".to_string()),
    ]);
    let job_id = storage
        .create_expired_job(&sample_job(), &parameters, Utc::now(), Duration::from_secs(3600))
        .await
        .expect("failed to create job");
    assert_eq!(job_id, "1");

    let culture = storage
        .get_job_parameter(&job_id, "CurrentCulture")
        .await
        .expect("parameter read failed");
    assert_eq!(culture.as_deref(), Some("en-US"));

    storage
        .set_job_parameter(&job_id, "RetryCount", "1")
        .await
        .expect("parameter upsert failed");
    let retries = storage
        .get_job_parameter(&job_id, "RetryCount")
        .await
        .expect("parameter read failed");
    assert_eq!(retries.as_deref(), Some("1"));

    let job = storage
        .get_job_data(&job_id)
        .await
        .expect("job read failed")
        .expect("job must exist");
    assert!(job.load_error.is_none());
    assert_eq!(job.arguments, sample_job().arguments);
    let invocation = job.invocation.expect("invocation must parse");
    assert_eq!(invocation["method"], "SendWelcomeEmail");
}

#[sqlx::test]
async fn malformed_invocation_data_becomes_a_load_error(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let broken = JobDescriptor {
        invocation_data: "{not json".to_string(),
        arguments: "[]".to_string(),
    };
    let job_id = storage
        .create_expired_job(&broken, &HashMap::new(), Utc::now(), Duration::from_secs(60))
        .await
        .expect("failed to create job");

    let job = storage
        .get_job_data(&job_id)
        .await
        .expect("the read itself must succeed")
        .expect("job must exist");
    assert!(job.invocation.is_none());
    assert!(job.load_error.is_some());
}

#[sqlx::test]
async fn unknown_jobs_read_as_absent(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;
    assert!(storage
        .get_job_data("12345")
        .await
        .expect("read failed")
        .is_none());
    assert!(storage
        .get_state_data("12345")
        .await
        .expect("read failed")
        .is_none());
    assert!(matches!(
        storage.get_job_data("not-a-number").await,
        Err(StorageError::InvalidArgument(_))
    ));
}

#[sqlx::test]
async fn server_registry_lifecycle(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let data = ServerData {
        worker_count: 20,
        queues: vec!["default".to_string(), "critical".to_string()],
        started_at: Utc::now(),
    };
    storage
        .announce_server("worker-a:1", &data)
        .await
        .expect("announce failed");
    // Announcing again upserts rather than duplicating.
    storage
        .announce_server("worker-a:1", &data)
        .await
        .expect("announce failed");
    storage
        .announce_server("worker-b:1", &data)
        .await
        .expect("announce failed");

    storage
        .server_heartbeat("worker-a:1")
        .await
        .expect("heartbeat failed");

    // Nothing is old enough to collect yet.
    let removed = storage
        .remove_timed_out_servers(Duration::from_secs(3600))
        .await
        .expect("timeout sweep failed");
    assert_eq!(removed, 0);

    storage
        .remove_server("worker-b:1")
        .await
        .expect("remove failed");

    let err = storage
        .remove_timed_out_servers(Duration::ZERO)
        .await
        .expect_err("zero timeout must be rejected");
    assert!(matches!(err, StorageError::InvalidArgument(_)));
}

#[sqlx::test]
async fn counters_default_to_zero(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;
    assert_eq!(
        storage
            .get_counter("stats:deleted")
            .await
            .expect("counter read failed"),
        0
    );

    let mut tx = storage.create_transaction();
    tx.increment_counter("stats:deleted");
    tx.increment_counter("stats:deleted");
    tx.decrement_counter("stats:deleted");
    tx.commit().await.expect("failed to commit");

    assert_eq!(
        storage
            .get_counter("stats:deleted")
            .await
            .expect("counter read failed"),
        1
    );
}

#[sqlx::test]
async fn job_promotion_survives_the_initial_expiry(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;
    let job_id = create_job(&storage).await;

    // A queued state transition persists the job, taking it out of the
    // expiration manager's reach.
    let mut tx = storage.create_transaction();
    tx.persist_job(&job_id).expect("failed to queue persist");
    tx.set_job_state(&job_id, common::sample_state("Enqueued"))
        .expect("failed to queue state");
    tx.add_to_queue("default", &job_id)
        .expect("failed to queue enqueue");
    tx.commit().await.expect("failed to commit");

    let expiration = storage.expiration_manager();
    expiration
        .expire_once(&tokio_util::sync::CancellationToken::new())
        .await;

    assert!(storage
        .get_job_data(&job_id)
        .await
        .expect("read failed")
        .is_some());
}
