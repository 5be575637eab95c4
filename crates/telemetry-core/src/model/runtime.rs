use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeKind {
    Core,
    Framework,
}

/// One managed-runtime diagnostic sample per monitored app per emission
/// interval (spec.md §3.1).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagedRuntimeSample {
    pub id: Option<i64>,
    pub run_id: i64,
    pub timestamp: i64,

    pub app_label: String,
    pub process_name: String,
    pub runtime_kind: RuntimeKind,

    pub heap_size_mb: f64,
    /// Only meaningful for `RuntimeKind::Core`.
    pub allocation_rate_mb_per_sec: Option<f64>,
    pub gen0_collections_per_sec: f64,
    pub gen1_collections_per_sec: f64,
    pub gen2_collections_per_sec: f64,
    pub gc_time_percent: f64,
    pub exception_rate: f64,
    pub thread_count: u64,
    pub thread_pool_thread_count: u64,
    pub thread_pool_queue_length: u64,
}
