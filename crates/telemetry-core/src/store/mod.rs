//! The durable append-only store (spec.md §6.2).
//!
//! spec.md treats the store as a black box specified only by its write
//! interface; the teacher's bespoke WAL+chunk+zstd physical format is
//! explicitly the kind of "storage schema physical representation" spec.md
//! §1 places out of scope. `SqliteStore` below is a straightforward
//! `rusqlite` (bundled SQLite) backend satisfying exactly the nine
//! operations spec.md §6.2 enumerates, pooled with `r2d2`/`r2d2_sqlite` so
//! concurrent writers (spec.md §5 — "thread-safe; concurrent writers
//! expected") don't serialize on a single `Mutex<Connection>`.

mod sqlite;

pub use sqlite::SqliteStore;

use std::fmt;

use crate::model::{DmvSample, HttpSample, ManagedRuntimeSample, Marker, ProcessSample, Run, SystemSample};

/// Raw cumulative relational-instance counters as last observed, persisted
/// so rate derivation (spec.md §4.5) can be audited or resumed across a
/// restart. Distinct from the derived `DmvSample` the sampler emits each
/// tick — see DESIGN.md for why spec.md §6.2's "insert DB Snapshot" and
/// "insert DMV Sample" are implemented as two separate operations.
#[derive(Clone, Debug, Default)]
pub struct DbCounterSnapshot {
    pub total_reads: i64,
    pub total_read_stall_ms: i64,
    pub total_read_bytes: i64,
    pub total_writes: i64,
    pub total_write_stall_ms: i64,
    pub total_write_bytes: i64,
}

#[derive(Debug)]
pub enum StoreError {
    Open(String),
    Write(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Open(msg) => write!(f, "failed to open store: {}", msg),
            StoreError::Write(msg) => write!(f, "store write failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// The write surface the Orchestrator and the capture components use.
/// Thread-safe: every implementation must tolerate concurrent calls from
/// multiple tasks (spec.md §5).
pub trait Store: Send + Sync {
    fn insert_run(&self, run: &Run) -> Result<i64, StoreError>;
    fn update_run_end(&self, run_id: i64, end_timestamp: i64, duration_seconds: f64) -> Result<(), StoreError>;
    fn insert_system_sample(&self, sample: &SystemSample) -> Result<i64, StoreError>;
    fn insert_process_samples(&self, samples: &[ProcessSample]) -> Result<(), StoreError>;
    fn insert_db_snapshot(&self, run_id: i64, timestamp: i64, snapshot: &DbCounterSnapshot) -> Result<(), StoreError>;
    fn insert_marker(&self, marker: &Marker) -> Result<(), StoreError>;
    fn insert_managed_runtime_samples(&self, samples: &[ManagedRuntimeSample]) -> Result<(), StoreError>;
    fn insert_dmv_sample(&self, sample: &DmvSample) -> Result<(), StoreError>;
    fn insert_http_samples(&self, samples: &[HttpSample]) -> Result<(), StoreError>;
}
