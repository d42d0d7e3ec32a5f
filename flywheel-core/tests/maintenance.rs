use std::time::Duration;

use chrono::Utc;
use common::{test_storage, PREFIX};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use tokio_util::sync::CancellationToken;

mod common;

async fn raw_counter_rows(pool: &sqlx::MySqlPool, key: &str) -> i64 {
    sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM `{PREFIX}Counter` WHERE `Key` = ?"
    ))
    .bind(key)
    .fetch_one(pool)
    .await
    .expect("count failed")
}

#[sqlx::test]
async fn aggregation_folds_the_backlog_without_moving_the_reading(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    // 2,500 raw increments for one key, far beyond a single 1,000-row pass.
    let expire_at = Utc::now() + chrono::Duration::hours(3);
    for chunk in 0..25 {
        let mut insert = format!(
            "INSERT INTO `{PREFIX}Counter` (`Key`, `Value`, `ExpireAt`) VALUES "
        );
        insert.push_str(&vec!["('stats:k', 1, ?)"; 100].join(","));
        let mut query = sqlx::query(&insert);
        for _ in 0..100 {
            query = query.bind(expire_at);
        }
        query
            .execute(storage.pool())
            .await
            .unwrap_or_else(|e| panic!("seed chunk {chunk} failed: {e}"));
    }
    assert_eq!(raw_counter_rows(storage.pool(), "stats:k").await, 2500);
    assert_eq!(
        storage.get_counter("stats:k").await.expect("read failed"),
        2500
    );

    let aggregator = storage.counters_aggregator();
    let cancel = CancellationToken::new();

    // Pass one and two run full; the third drains the remainder.
    for expected in [1000, 1000, 500] {
        let folded = aggregator
            .aggregate_once(&cancel)
            .await
            .expect("aggregation pass failed");
        assert_eq!(folded, expected);
        assert_eq!(
            storage.get_counter("stats:k").await.expect("read failed"),
            2500,
            "aggregation must be invisible to readers"
        );
    }

    assert_eq!(raw_counter_rows(storage.pool(), "stats:k").await, 0);
    let aggregated: i64 = sqlx::query_scalar(&format!(
        "SELECT `Value` FROM `{PREFIX}AggregatedCounter` WHERE `Key` = 'stats:k'"
    ))
    .fetch_one(storage.pool())
    .await
    .expect("aggregated row missing");
    assert_eq!(aggregated, 2500);
}

#[sqlx::test]
async fn drain_loops_until_the_backlog_is_short(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    for _ in 0..30 {
        let mut tx = storage.create_transaction();
        tx.increment_counter("stats:small");
        tx.commit().await.expect("commit failed");
    }

    let aggregator = storage.counters_aggregator().with_pass_size(10);
    let folded = aggregator
        .drain(&CancellationToken::new())
        .await
        .expect("drain failed");
    assert_eq!(folded, 30);
    assert_eq!(raw_counter_rows(storage.pool(), "stats:small").await, 0);
    assert_eq!(
        storage
            .get_counter("stats:small")
            .await
            .expect("read failed"),
        30
    );
}

#[sqlx::test]
async fn expiration_sweeps_expired_rows_everywhere(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;
    let past = Utc::now() - chrono::Duration::hours(1);
    let future = Utc::now() + chrono::Duration::hours(1);

    sqlx::query(&format!(
        "INSERT INTO `{PREFIX}Counter` (`Key`, `Value`, `ExpireAt`) VALUES \
         ('dead', 1, ?), ('alive', 1, ?)"
    ))
    .bind(past)
    .bind(future)
    .execute(storage.pool())
    .await
    .expect("seed failed");
    sqlx::query(&format!(
        "INSERT INTO `{PREFIX}Set` (`Key`, `Value`, `Score`, `ExpireAt`) VALUES \
         ('dead-set', 'v', 0, ?)"
    ))
    .bind(past)
    .execute(storage.pool())
    .await
    .expect("seed failed");

    let expiration = storage.expiration_manager();
    let cancel = CancellationToken::new();

    // A handful of rounds clears every expired row; rows without a lapsed
    // expiry survive.
    for _ in 0..5 {
        expiration.expire_once(&cancel).await;
    }

    assert_eq!(raw_counter_rows(storage.pool(), "dead").await, 0);
    assert_eq!(raw_counter_rows(storage.pool(), "alive").await, 1);
    assert_eq!(
        storage
            .get_set_count("dead-set")
            .await
            .expect("count failed"),
        0
    );

    let sweep_found_nothing = !expiration.expire_once(&cancel).await;
    assert!(sweep_found_nothing, "an exhausted sweep must report idle");
}

#[sqlx::test]
async fn cancelled_workers_stop_promptly(
    _pool_opts: MySqlPoolOptions,
    conn_opts: MySqlConnectOptions,
) {
    let storage = test_storage(conn_opts).await;

    let aggregator = storage.counters_aggregator();
    let expiration = storage.expiration_manager();
    let cancel = CancellationToken::new();

    let workers = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::join!(aggregator.run(cancel.clone()), expiration.run(cancel));
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), workers)
        .await
        .expect("workers must stop after cancellation")
        .expect("worker task panicked");
}
