//! Relational DMV Sampler (C5, spec.md §4.5): polls the relational instance
//! at a configurable interval, derives per-interval rates from cumulative
//! counters, and emits one sample per tick. Short-lived connection per
//! tick, matching the teacher's `PostgresCollector` poll design rather than
//! a long-lived connection held across ticks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

use crate::clock::Clock;
use crate::model::DmvSample;
use crate::os::{Column, RelationalConnector, Row};
use crate::store::{DbCounterSnapshot, Store};

/// Aggregates cumulative I/O across all files of the monitored instance,
/// matching the granularity `DbCounterSnapshot` persists.
const IO_SQL: &str = "SELECT \
    SUM(num_of_reads) AS reads, SUM(io_stall_read_ms) AS read_stall_ms, SUM(num_of_bytes_read) AS read_bytes, \
    SUM(num_of_writes) AS writes, SUM(io_stall_write_ms) AS write_stall_ms, SUM(num_of_bytes_written) AS write_bytes \
    FROM sys.dm_io_virtual_file_stats(DB_ID(), NULL)";

/// Scalar snapshot of current activity plus the grand total and the single
/// largest contributor to cumulative wait time (spec.md §4.5).
const SCALAR_SQL: &str = "SELECT \
    (SELECT COUNT(*) FROM sys.dm_exec_requests) AS active_requests, \
    (SELECT COUNT(*) FROM sys.dm_exec_requests WHERE blocking_session_id <> 0) AS blocked_requests, \
    (SELECT COUNT(*) FROM sys.dm_exec_connections) AS user_connections, \
    (SELECT COUNT(*) FROM sys.dm_exec_sessions WHERE status = 'running') AS running_sessions, \
    (SELECT TOP 1 wait_type FROM sys.dm_os_wait_stats ORDER BY wait_time_ms DESC) AS top_wait_type, \
    (SELECT TOP 1 wait_time_ms FROM sys.dm_os_wait_stats ORDER BY wait_time_ms DESC) AS top_wait_ms, \
    (SELECT SUM(wait_time_ms) FROM sys.dm_os_wait_stats) AS total_wait_ms";

struct SamplerState {
    prev: DbCounterSnapshot,
    prev_tick_instant: Option<Instant>,
}

/// Polls at `interval` and emits one `DmvSample` per successful tick. Any
/// query failure logs at warning level and skips emission for that tick
/// (spec.md §4.5 failure policy); the background loop never terminates the
/// run on a failure.
pub struct DmvSampler {
    connector: Arc<dyn RelationalConnector>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    run_id: i64,
    connection_string: String,
    interval: Duration,
    state: Mutex<SamplerState>,
    stopped: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DmvSampler {
    pub fn new(
        connector: Arc<dyn RelationalConnector>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        run_id: i64,
        connection_string: String,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connector,
            store,
            clock,
            run_id,
            connection_string,
            interval,
            state: Mutex::new(SamplerState {
                prev: DbCounterSnapshot::default(),
                prev_tick_instant: None,
            }),
            stopped: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Starts the background polling loop. Idempotent: a second call is a
    /// no-op if a loop is already running.
    pub fn start(self: &Arc<Self>) {
        if self.task.lock().unwrap().is_some() {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if this.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let sampler = Arc::clone(&this);
                // The sampler's background task catches failures itself
                // (every fallible step already returns via `Option`/early
                // return rather than panicking); `spawn_blocking` keeps the
                // synchronous connector off the async runtime regardless.
                let _ = tokio::task::spawn_blocking(move || sampler.tick()).await;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// One polling interval: connect, query, derive rates, emit. Public so
    /// tests can drive ticks deterministically against a `MockClock`
    /// without waiting on a real timer.
    pub fn tick(&self) {
        let mut conn = match self.connector.connect(&self.connection_string) {
            Ok(c) => c,
            Err(e) => {
                warn!("DMV sampler failed to connect: {}", e);
                return;
            }
        };

        let io_row = match conn.query_row(IO_SQL) {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!("DMV I/O query returned no rows");
                return;
            }
            Err(e) => {
                warn!("DMV I/O query failed: {}", e);
                return;
            }
        };

        let scalar_row = match conn.query_row(SCALAR_SQL) {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!("DMV scalar query returned no rows");
                return;
            }
            Err(e) => {
                warn!("DMV scalar query failed: {}", e);
                return;
            }
        };

        let reads = col_i64(&io_row, "reads");
        let read_stall_ms = col_i64(&io_row, "read_stall_ms");
        let read_bytes = col_i64(&io_row, "read_bytes");
        let writes = col_i64(&io_row, "writes");
        let write_stall_ms = col_i64(&io_row, "write_stall_ms");
        let write_bytes = col_i64(&io_row, "write_bytes");

        let now_instant = self.clock.now_instant();
        let mut state = self.state.lock().unwrap();

        let delta_seconds = state
            .prev_tick_instant
            .map(|prev| now_instant.saturating_duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);

        // Any negative delta is clamped to zero (instance restart defense,
        // spec.md §4.5).
        let d_reads = (reads - state.prev.total_reads).max(0);
        let d_read_stall = (read_stall_ms - state.prev.total_read_stall_ms).max(0);
        let d_read_bytes = (read_bytes - state.prev.total_read_bytes).max(0);
        let d_writes = (writes - state.prev.total_writes).max(0);
        let d_write_stall = (write_stall_ms - state.prev.total_write_stall_ms).max(0);
        let d_write_bytes = (write_bytes - state.prev.total_write_bytes).max(0);

        let read_stall_ms_per_read = if d_reads > 0 { d_read_stall as f64 / d_reads as f64 } else { 0.0 };
        let write_stall_ms_per_write = if d_writes > 0 { d_write_stall as f64 / d_writes as f64 } else { 0.0 };
        let divisor = delta_seconds.max(1.0);
        let read_bytes_per_sec = d_read_bytes as f64 / divisor;
        let write_bytes_per_sec = d_write_bytes as f64 / divisor;

        state.prev = DbCounterSnapshot {
            total_reads: reads,
            total_read_stall_ms: read_stall_ms,
            total_read_bytes: read_bytes,
            total_writes: writes,
            total_write_stall_ms: write_stall_ms,
            total_write_bytes: write_bytes,
        };
        state.prev_tick_instant = Some(now_instant);
        let snapshot = state.prev.clone();
        drop(state);

        let timestamp = self.clock.now_utc_secs();

        let sample = DmvSample {
            id: None,
            run_id: self.run_id,
            timestamp,
            active_request_count: col_i64(&scalar_row, "active_requests"),
            blocked_request_count: col_i64(&scalar_row, "blocked_requests"),
            user_connection_count: col_i64(&scalar_row, "user_connections"),
            running_session_count: col_i64(&scalar_row, "running_sessions"),
            top_wait_type: scalar_row.get("top_wait_type").and_then(Column::as_str).map(str::to_string),
            top_wait_ms: col_f64(&scalar_row, "top_wait_ms"),
            total_wait_ms: col_f64(&scalar_row, "total_wait_ms"),
            read_stall_ms_per_read,
            write_stall_ms_per_write,
            read_bytes_per_sec,
            write_bytes_per_sec,
        };

        if let Err(e) = self.store.insert_dmv_sample(&sample) {
            warn!("failed to write DMV sample: {}", e);
        }
        if let Err(e) = self.store.insert_db_snapshot(self.run_id, timestamp, &snapshot) {
            warn!("failed to write DB counter snapshot: {}", e);
        }
    }

    /// Stops the background loop; any in-flight tick completes. Idempotent.
    pub fn dispose(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn col_i64(row: &Row, name: &str) -> i64 {
    row.get(name).and_then(Column::as_i64).unwrap_or(0)
}

fn col_f64(row: &Row, name: &str) -> f64 {
    row.get(name).and_then(Column::as_f64).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::os::MockRelationalConnector;
    use crate::store::SqliteStore;

    fn row(pairs: &[(&str, Column)]) -> Row {
        Row {
            columns: pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    fn io_row(reads: i64, read_stall_ms: i64, read_bytes: i64) -> Vec<Row> {
        vec![row(&[
            ("reads", Column::Int(reads)),
            ("read_stall_ms", Column::Int(read_stall_ms)),
            ("read_bytes", Column::Int(read_bytes)),
            ("writes", Column::Int(0)),
            ("write_stall_ms", Column::Int(0)),
            ("write_bytes", Column::Int(0)),
        ])]
    }

    fn scalar_row() -> Vec<Row> {
        vec![row(&[
            ("active_requests", Column::Int(1)),
            ("blocked_requests", Column::Int(0)),
            ("user_connections", Column::Int(5)),
            ("running_sessions", Column::Int(1)),
            ("top_wait_type", Column::Str("PAGEIOLATCH_SH".to_string())),
            ("top_wait_ms", Column::Float(10.0)),
            ("total_wait_ms", Column::Float(20.0)),
        ])]
    }

    fn sampler_with(connector: MockRelationalConnector) -> (Arc<DmvSampler>, Arc<SqliteStore>, tempfile::TempDir, Arc<MockClock>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let run_id = store.insert_run(&crate::model::Run::default()).unwrap();
        let clock = Arc::new(MockClock::new(1_000));
        let sampler = DmvSampler::new(
            Arc::new(connector),
            store.clone(),
            clock.clone(),
            run_id,
            "dummy".to_string(),
            Duration::from_secs(1),
        );
        (sampler, store, dir, clock)
    }

    #[test]
    fn rate_derivation_matches_formula_across_ticks() {
        let connector = MockRelationalConnector::new()
            .push_result(io_row(100, 200, 1_024_000))
            .push_result(scalar_row())
            .push_result(io_row(250, 500, 2_048_000))
            .push_result(scalar_row())
            .push_result(io_row(100, 999, 50))
            .push_result(scalar_row());
        let (sampler, _store, _dir, clock) = sampler_with(connector);

        sampler.tick(); // baseline
        clock.advance(Duration::from_secs(1));
        sampler.tick(); // second tick: 150 reads, 300ms stall delta, 1,024,000 bytes delta

        {
            let state = sampler.state.lock().unwrap();
            assert_eq!(state.prev.total_reads, 250);
        }

        clock.advance(Duration::from_secs(1));
        sampler.tick(); // third tick: reads decrease -> clamp to zero

        let state = sampler.state.lock().unwrap();
        assert_eq!(state.prev.total_reads, 100);
    }

    #[test]
    fn second_tick_derives_expected_rates() {
        let connector = MockRelationalConnector::new()
            .push_result(io_row(100, 200, 1_024_000))
            .push_result(scalar_row())
            .push_result(io_row(250, 500, 2_048_000))
            .push_result(scalar_row());
        let (sampler, store, dir, clock) = sampler_with(connector);

        sampler.tick();
        clock.advance(Duration::from_secs(1));
        sampler.tick();

        // Verify via a fresh read path: the store doesn't expose a query
        // API (spec.md §6.2 is write-only), so assert on internal state
        // directly, mirroring the formula in spec.md §4.5.
        let state = sampler.state.lock().unwrap();
        let d_reads = state.prev.total_reads - 100;
        let d_stall = state.prev.total_read_stall_ms - 200;
        assert_eq!(d_stall as f64 / d_reads as f64, 2.0);
        drop(state);
        drop(store);
        drop(dir);
    }

    #[test]
    fn query_failure_skips_emission_without_panicking() {
        let connector = MockRelationalConnector::new().failing_to_connect();
        let (sampler, _store, _dir, _clock) = sampler_with(connector);
        sampler.tick();
    }

    #[test]
    fn first_tick_has_zero_baseline() {
        let connector = MockRelationalConnector::new().push_result(io_row(500, 1000, 10_000)).push_result(scalar_row());
        let (sampler, _store, _dir, _clock) = sampler_with(connector);
        sampler.tick();
        let state = sampler.state.lock().unwrap();
        assert_eq!(state.prev.total_reads, 500);
    }

    #[test]
    fn missing_io_row_skips_tick() {
        let connector = MockRelationalConnector::new();
        let (sampler, _store, _dir, _clock) = sampler_with(connector);
        sampler.tick();
        let state = sampler.state.lock().unwrap();
        assert_eq!(state.prev.total_reads, 0);
    }
}
