use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

use crate::model::{
    DmvSample, HttpSample, ManagedRuntimeSample, Marker, MarkerKind, MarkerLevel, ProcessSample, Run,
    RuntimeKind, SystemSample,
};

use super::{DbCounterSnapshot, Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_timestamp INTEGER NOT NULL,
    end_timestamp INTEGER,
    duration_seconds REAL,
    machine_name TEXT NOT NULL,
    os_identifier TEXT NOT NULL,
    logical_core_count INTEGER NOT NULL,
    cpu_model TEXT NOT NULL,
    total_physical_memory_mb INTEGER NOT NULL,
    system_drive_type TEXT NOT NULL,
    system_drive_free_mb INTEGER NOT NULL,
    uptime_seconds_at_start INTEGER NOT NULL,
    scenario_label TEXT NOT NULL,
    notes TEXT NOT NULL,
    workload_type TEXT NOT NULL,
    workload_size_estimate TEXT NOT NULL,
    workload_notes TEXT NOT NULL,
    captured_config TEXT NOT NULL,
    tool_version TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    timestamp INTEGER NOT NULL,
    cpu_total_percent REAL,
    memory_in_use_mb REAL,
    memory_available_mb REAL,
    disk_reads_per_sec REAL,
    disk_writes_per_sec REAL,
    disk_read_bytes_per_sec REAL,
    disk_write_bytes_per_sec REAL,
    net_bytes_sent_per_sec REAL,
    net_bytes_received_per_sec REAL
);
CREATE INDEX IF NOT EXISTS idx_system_samples_run ON system_samples(run_id, timestamp);

CREATE TABLE IF NOT EXISTS process_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_sample_id INTEGER NOT NULL REFERENCES system_samples(id),
    process_name TEXT NOT NULL,
    cpu_percent REAL NOT NULL,
    working_set_mb REAL NOT NULL,
    private_bytes_mb REAL NOT NULL,
    thread_count INTEGER NOT NULL,
    handle_count INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_process_samples_parent ON process_samples(system_sample_id);

CREATE TABLE IF NOT EXISTS markers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    timestamp INTEGER NOT NULL,
    kind TEXT NOT NULL,
    level TEXT NOT NULL,
    label TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_markers_run ON markers(run_id, timestamp);

CREATE TABLE IF NOT EXISTS managed_runtime_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    timestamp INTEGER NOT NULL,
    app_label TEXT NOT NULL,
    process_name TEXT NOT NULL,
    runtime_kind TEXT NOT NULL,
    heap_size_mb REAL NOT NULL,
    allocation_rate_mb_per_sec REAL,
    gen0_collections_per_sec REAL NOT NULL,
    gen1_collections_per_sec REAL NOT NULL,
    gen2_collections_per_sec REAL NOT NULL,
    gc_time_percent REAL NOT NULL,
    exception_rate REAL NOT NULL,
    thread_count INTEGER NOT NULL,
    thread_pool_thread_count INTEGER NOT NULL,
    thread_pool_queue_length INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_managed_runtime_samples_run ON managed_runtime_samples(run_id, timestamp);

CREATE TABLE IF NOT EXISTS dmv_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    timestamp INTEGER NOT NULL,
    active_request_count INTEGER NOT NULL,
    blocked_request_count INTEGER NOT NULL,
    user_connection_count INTEGER NOT NULL,
    running_session_count INTEGER NOT NULL,
    top_wait_type TEXT,
    top_wait_ms REAL NOT NULL,
    total_wait_ms REAL NOT NULL,
    read_stall_ms_per_read REAL NOT NULL,
    write_stall_ms_per_write REAL NOT NULL,
    read_bytes_per_sec REAL NOT NULL,
    write_bytes_per_sec REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dmv_samples_run ON dmv_samples(run_id, timestamp);

CREATE TABLE IF NOT EXISTS db_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    timestamp INTEGER NOT NULL,
    total_reads INTEGER NOT NULL,
    total_read_stall_ms INTEGER NOT NULL,
    total_read_bytes INTEGER NOT NULL,
    total_writes INTEGER NOT NULL,
    total_write_stall_ms INTEGER NOT NULL,
    total_write_bytes INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS http_samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL REFERENCES runs(id),
    bucket_start INTEGER NOT NULL,
    app_label TEXT NOT NULL,
    process_name TEXT NOT NULL,
    endpoint_group TEXT NOT NULL,
    request_count INTEGER NOT NULL,
    success_count INTEGER NOT NULL,
    client_error_count INTEGER NOT NULL,
    server_error_count INTEGER NOT NULL,
    other_status_count INTEGER NOT NULL,
    total_duration_ms REAL NOT NULL,
    avg_duration_ms REAL NOT NULL,
    min_duration_ms REAL NOT NULL,
    max_duration_ms REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_http_samples_bucket ON http_samples(run_id, app_label, endpoint_group, bucket_start);
"#;

/// SQLite-backed implementation of `Store`.
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// schema exists.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });
        let pool = Pool::builder()
            .build(manager)
            .map_err(|e| StoreError::Open(e.to_string()))?;

        let conn = pool.get().map_err(|e| StoreError::Open(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Open(e.to_string()))?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        self.pool.get().map_err(|e| StoreError::Write(e.to_string()))
    }
}

fn runtime_kind_str(kind: RuntimeKind) -> &'static str {
    match kind {
        RuntimeKind::Core => "core",
        RuntimeKind::Framework => "framework",
    }
}

fn marker_kind_str(kind: MarkerKind) -> &'static str {
    match kind {
        MarkerKind::ProcessStarted => "process_started",
        MarkerKind::ProcessExited => "process_exited",
        MarkerKind::ToolError => "tool_error",
        MarkerKind::Annotation => "annotation",
    }
}

fn marker_level_str(level: MarkerLevel) -> &'static str {
    match level {
        MarkerLevel::Info => "info",
        MarkerLevel::Warning => "warning",
        MarkerLevel::Error => "error",
    }
}

impl Store for SqliteStore {
    fn insert_run(&self, run: &Run) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (
                start_timestamp, end_timestamp, duration_seconds, machine_name, os_identifier,
                logical_core_count, cpu_model, total_physical_memory_mb, system_drive_type,
                system_drive_free_mb, uptime_seconds_at_start, scenario_label, notes,
                workload_type, workload_size_estimate, workload_notes, captured_config, tool_version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                run.start_timestamp,
                run.end_timestamp,
                run.duration_seconds,
                run.machine_name,
                run.os_identifier,
                run.logical_core_count,
                run.cpu_model,
                run.total_physical_memory_mb as i64,
                run.system_drive_type,
                run.system_drive_free_mb as i64,
                run.uptime_seconds_at_start as i64,
                run.scenario_label,
                run.notes,
                run.workload.workload_type,
                run.workload.size_estimate,
                run.workload.notes,
                run.captured_config,
                run.tool_version,
            ],
        )
        .map_err(|e| StoreError::Write(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    fn update_run_end(&self, run_id: i64, end_timestamp: i64, duration_seconds: f64) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "UPDATE runs SET end_timestamp = ?1, duration_seconds = ?2 WHERE id = ?3",
                params![end_timestamp, duration_seconds, run_id],
            )
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    fn insert_system_sample(&self, sample: &SystemSample) -> Result<i64, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO system_samples (
                run_id, timestamp, cpu_total_percent, memory_in_use_mb, memory_available_mb,
                disk_reads_per_sec, disk_writes_per_sec, disk_read_bytes_per_sec,
                disk_write_bytes_per_sec, net_bytes_sent_per_sec, net_bytes_received_per_sec
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                sample.run_id,
                sample.timestamp,
                sample.cpu_total_percent,
                sample.memory_in_use_mb,
                sample.memory_available_mb,
                sample.disk_reads_per_sec,
                sample.disk_writes_per_sec,
                sample.disk_read_bytes_per_sec,
                sample.disk_write_bytes_per_sec,
                sample.net_bytes_sent_per_sec,
                sample.net_bytes_received_per_sec,
            ],
        )
        .map_err(|e| StoreError::Write(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    fn insert_process_samples(&self, samples: &[ProcessSample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| StoreError::Write(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO process_samples (
                        system_sample_id, process_name, cpu_percent, working_set_mb,
                        private_bytes_mb, thread_count, handle_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )
                .map_err(|e| StoreError::Write(e.to_string()))?;
            for sample in samples {
                stmt.execute(params![
                    sample.system_sample_id,
                    sample.process_name,
                    sample.cpu_percent,
                    sample.working_set_mb,
                    sample.private_bytes_mb,
                    sample.thread_count as i64,
                    sample.handle_count as i64,
                ])
                .map_err(|e| StoreError::Write(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    fn insert_db_snapshot(&self, run_id: i64, timestamp: i64, snapshot: &DbCounterSnapshot) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO db_snapshots (
                    run_id, timestamp, total_reads, total_read_stall_ms, total_read_bytes,
                    total_writes, total_write_stall_ms, total_write_bytes
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run_id,
                    timestamp,
                    snapshot.total_reads,
                    snapshot.total_read_stall_ms,
                    snapshot.total_read_bytes,
                    snapshot.total_writes,
                    snapshot.total_write_stall_ms,
                    snapshot.total_write_bytes,
                ],
            )
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    fn insert_marker(&self, marker: &Marker) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO markers (run_id, timestamp, kind, level, label) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    marker.run_id,
                    marker.timestamp,
                    marker_kind_str(marker.kind),
                    marker_level_str(marker.level),
                    marker.label,
                ],
            )
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    fn insert_managed_runtime_samples(&self, samples: &[ManagedRuntimeSample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| StoreError::Write(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO managed_runtime_samples (
                        run_id, timestamp, app_label, process_name, runtime_kind, heap_size_mb,
                        allocation_rate_mb_per_sec, gen0_collections_per_sec, gen1_collections_per_sec,
                        gen2_collections_per_sec, gc_time_percent, exception_rate, thread_count,
                        thread_pool_thread_count, thread_pool_queue_length
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                )
                .map_err(|e| StoreError::Write(e.to_string()))?;
            for sample in samples {
                stmt.execute(params![
                    sample.run_id,
                    sample.timestamp,
                    sample.app_label,
                    sample.process_name,
                    runtime_kind_str(sample.runtime_kind),
                    sample.heap_size_mb,
                    sample.allocation_rate_mb_per_sec,
                    sample.gen0_collections_per_sec,
                    sample.gen1_collections_per_sec,
                    sample.gen2_collections_per_sec,
                    sample.gc_time_percent,
                    sample.exception_rate,
                    sample.thread_count as i64,
                    sample.thread_pool_thread_count as i64,
                    sample.thread_pool_queue_length as i64,
                ])
                .map_err(|e| StoreError::Write(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    fn insert_dmv_sample(&self, sample: &DmvSample) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO dmv_samples (
                    run_id, timestamp, active_request_count, blocked_request_count,
                    user_connection_count, running_session_count, top_wait_type, top_wait_ms,
                    total_wait_ms, read_stall_ms_per_read, write_stall_ms_per_write,
                    read_bytes_per_sec, write_bytes_per_sec
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    sample.run_id,
                    sample.timestamp,
                    sample.active_request_count,
                    sample.blocked_request_count,
                    sample.user_connection_count,
                    sample.running_session_count,
                    sample.top_wait_type,
                    sample.top_wait_ms,
                    sample.total_wait_ms,
                    sample.read_stall_ms_per_read,
                    sample.write_stall_ms_per_write,
                    sample.read_bytes_per_sec,
                    sample.write_bytes_per_sec,
                ],
            )
            .map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }

    fn insert_http_samples(&self, samples: &[HttpSample]) -> Result<(), StoreError> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(|e| StoreError::Write(e.to_string()))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO http_samples (
                        run_id, bucket_start, app_label, process_name, endpoint_group,
                        request_count, success_count, client_error_count, server_error_count,
                        other_status_count, total_duration_ms, avg_duration_ms, min_duration_ms,
                        max_duration_ms
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                )
                .map_err(|e| StoreError::Write(e.to_string()))?;
            for sample in samples {
                stmt.execute(params![
                    sample.run_id,
                    sample.bucket_start,
                    sample.app_label,
                    sample.process_name,
                    sample.endpoint_group,
                    sample.request_count as i64,
                    sample.success_count as i64,
                    sample.client_error_count as i64,
                    sample.server_error_count as i64,
                    sample.other_status_count as i64,
                    sample.total_duration_ms,
                    sample.avg_duration_ms,
                    sample.min_duration_ms,
                    sample.max_duration_ms,
                ])
                .map_err(|e| StoreError::Write(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| StoreError::Write(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Run;

    fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn insert_run_assigns_id_and_round_trips_end_update() {
        let (_dir, store) = temp_store();
        let run = Run {
            machine_name: "HOST1".into(),
            ..Run::default()
        };

        let run_id = store.insert_run(&run).unwrap();
        assert!(run_id >= 1);

        store.update_run_end(run_id, 1_700_000_100, 100.0).unwrap();
    }

    #[test]
    fn insert_process_samples_is_noop_on_empty_slice() {
        let (_dir, store) = temp_store();
        store.insert_process_samples(&[]).unwrap();
    }

    #[test]
    fn insert_system_sample_returns_increasing_ids() {
        let (_dir, store) = temp_store();
        let run_id = store.insert_run(&Run::default()).unwrap();

        let s1 = SystemSample {
            run_id,
            timestamp: 1,
            ..SystemSample::default()
        };
        let s2 = SystemSample {
            run_id,
            timestamp: 2,
            ..SystemSample::default()
        };

        let id1 = store.insert_system_sample(&s1).unwrap();
        let id2 = store.insert_system_sample(&s2).unwrap();
        assert!(id2 > id1);
    }
}
