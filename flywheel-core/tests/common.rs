use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use flywheel_core::{JobDescriptor, PoolConfig, StateRecord, Storage, StorageOptions};
use sqlx::mysql::MySqlConnectOptions;

#[allow(dead_code)]
pub const PREFIX: &str = "hf_";

#[allow(dead_code)]
pub fn test_options() -> StorageOptions {
    StorageOptions {
        tables_prefix: PREFIX.to_string(),
        // Keep polling snappy so cancellation-driven tests finish quickly.
        queue_poll_interval: Duration::from_secs(1),
        ..Default::default()
    }
}

/// Builds the storage through its own pool config so the advisory-lock
/// recycle hook is installed, then runs the installer against the fresh
/// per-test database.
#[allow(dead_code)]
pub async fn test_storage(connect_opts: MySqlConnectOptions) -> Storage {
    test_storage_with(connect_opts, test_options()).await
}

#[allow(dead_code)]
pub async fn test_storage_with(
    connect_opts: MySqlConnectOptions,
    options: StorageOptions,
) -> Storage {
    let config = PoolConfig {
        db_url: String::new(), // unused; we connect with explicit options
        max_connections: Some(10),
        min_connections: Some(1),
        acquire_timeout_seconds: Some(30),
        max_lifetime_seconds: Some(300),
        idle_timeout_seconds: Some(60),
    };
    Storage::connect_with(&config, connect_opts, options)
        .await
        .expect("failed to build test storage")
}

#[allow(dead_code)]
pub fn sample_job() -> JobDescriptor {
    JobDescriptor {
        invocation_data: r#"{"type":"Notifications","method":"SendWelcomeEmail"}"#.to_string(),
        arguments: r#"["42"]"#.to_string(),
    }
}

#[allow(dead_code)]
pub fn sample_state(name: &str) -> StateRecord {
    StateRecord {
        name: name.to_string(),
        reason: Some("test transition".to_string()),
        data: HashMap::from([(
            "EnqueuedAt".to_string(),
            Utc::now().to_rfc3339(),
        )]),
    }
}

/// Creates a job that lives for an hour and returns its public id.
#[allow(dead_code)]
pub async fn create_job(storage: &Storage) -> String {
    storage
        .create_expired_job(
            &sample_job(),
            &HashMap::new(),
            Utc::now(),
            Duration::from_secs(60 * 60),
        )
        .await
        .expect("failed to create job")
}
