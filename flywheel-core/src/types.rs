use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The chunk of data needed to create a job: the serialized invocation
/// payload plus its serialized arguments. Both are opaque to the core; the
/// host framework owns their shape.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct JobDescriptor {
    pub invocation_data: String,
    pub arguments: String,
}

/// A job record as read back from storage. `invocation` is the parsed form
/// of the stored invocation data; when parsing fails the read still
/// succeeds and the failure is carried in `load_error`.
#[derive(Debug, Deserialize, Serialize)]
pub struct JobData {
    pub invocation: Option<serde_json::Value>,
    pub arguments: String,
    pub state_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub load_error: Option<String>,
}

/// One state transition: the target state name, an optional human-readable
/// reason, and a free-form data map serialized alongside.
#[derive(Debug, Deserialize, Serialize, Clone, Default, Eq, PartialEq)]
pub struct StateRecord {
    pub name: String,
    pub reason: Option<String>,
    pub data: HashMap<String, String>,
}

/// Payload persisted for a registered worker process.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerData {
    pub worker_count: u32,
    pub queues: Vec<String>,
    pub started_at: DateTime<Utc>,
}

/// Sentinel returned by the TTL reads when a key has no row, or no row with
/// an expiry set.
pub fn no_ttl() -> Duration {
    Duration::seconds(-1)
}

/// Job ids cross the public API in textual form; everything internal works
/// on the numeric primary key.
pub(crate) fn parse_job_id(raw: &str) -> Result<u64, crate::error::StorageError> {
    raw.parse().map_err(|_| {
        crate::error::StorageError::InvalidArgument(format!("malformed job id {raw:?}"))
    })
}
