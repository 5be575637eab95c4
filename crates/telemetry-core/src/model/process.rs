use serde::{Deserialize, Serialize};

/// One observed process-name group within a `SystemSample` (spec.md §3.1).
/// Fields are aggregated across all live instances sharing that name; a
/// `ProcessSample` has no stable cross-tick identity.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessSample {
    pub id: Option<i64>,
    pub system_sample_id: i64,
    pub process_name: String,

    pub cpu_percent: f64,
    pub working_set_mb: f64,
    pub private_bytes_mb: f64,
    pub thread_count: u64,
    pub handle_count: u64,
}
