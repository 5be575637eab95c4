use serde::{Deserialize, Serialize};

/// A single invocation's bounded capture session (spec.md §3.1).
///
/// Immutable after creation except for `end_timestamp`/`duration_seconds`,
/// set exactly once on orderly shutdown.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Run {
    /// Assigned by the store on insert; `None` until then.
    pub id: Option<i64>,
    pub start_timestamp: i64,
    pub end_timestamp: Option<i64>,
    pub duration_seconds: Option<f64>,

    pub machine_name: String,
    pub os_identifier: String,
    pub logical_core_count: u32,
    pub cpu_model: String,
    pub total_physical_memory_mb: u64,
    pub system_drive_type: String,
    pub system_drive_free_mb: u64,
    pub uptime_seconds_at_start: u64,

    pub scenario_label: String,
    pub notes: String,
    pub workload: WorkloadDescriptor,
    /// Opaque captured-config snapshot (not parsed back by this crate).
    pub captured_config: String,
    pub tool_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub workload_type: String,
    pub size_estimate: String,
    pub notes: String,
}
