use serde::{Deserialize, Serialize};

/// One tick of the master sampling clock (spec.md §3.1). Any field may be
/// absent when its source was unavailable or a read failed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SystemSample {
    pub id: Option<i64>,
    pub run_id: i64,
    pub timestamp: i64,

    pub cpu_total_percent: Option<f64>,
    pub memory_in_use_mb: Option<f64>,
    pub memory_available_mb: Option<f64>,

    pub disk_reads_per_sec: Option<f64>,
    pub disk_writes_per_sec: Option<f64>,
    pub disk_read_bytes_per_sec: Option<f64>,
    pub disk_write_bytes_per_sec: Option<f64>,

    pub net_bytes_sent_per_sec: Option<f64>,
    pub net_bytes_received_per_sec: Option<f64>,
}
