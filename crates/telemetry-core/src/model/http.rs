use serde::{Deserialize, Serialize};

/// One (app, endpoint-group, bucket-start) aggregate (spec.md §3.1). Only
/// emitted when at least one request completed inside the bucket.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HttpSample {
    pub id: Option<i64>,
    pub run_id: i64,
    pub bucket_start: i64,

    pub app_label: String,
    pub process_name: String,
    pub endpoint_group: String,

    pub request_count: u64,
    pub success_count: u64,
    pub client_error_count: u64,
    pub server_error_count: u64,
    pub other_status_count: u64,

    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}
