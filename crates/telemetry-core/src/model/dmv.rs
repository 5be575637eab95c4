use serde::{Deserialize, Serialize};

/// One relational-instance polling sample (spec.md §3.1).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DmvSample {
    pub id: Option<i64>,
    pub run_id: i64,
    pub timestamp: i64,

    pub active_request_count: i64,
    pub blocked_request_count: i64,
    pub user_connection_count: i64,
    pub running_session_count: i64,

    pub top_wait_type: Option<String>,
    pub top_wait_ms: f64,
    pub total_wait_ms: f64,

    pub read_stall_ms_per_read: f64,
    pub write_stall_ms_per_write: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}
