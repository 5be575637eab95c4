//! Sampling Orchestrator (C6, spec.md §4.6): opens a run, constructs and
//! starts the five capture components in order, drives the master tick
//! loop, and tears everything down on cancellation. The only component
//! whose errors (`CoreError`) are allowed to escape to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::collector::http_reconstructor::HttpReconstructorArrivalListener;
use crate::collector::process_tracker::{cpu_percent, RuntimeSessionArrivalListener};
use crate::collector::runtime_session::RuntimeSessionArrivalListener as RuntimeArrivalListener;
use crate::collector::{ClassicRuntimeSampler, CounterReader, DmvSampler, HttpReconstructor, ManagedRuntimeSessionHost, ProcessLifecycleTracker};
use crate::config::Config;
use crate::error::CoreError;
use crate::model::{ProcessSample, Run, SystemSample};
use crate::os::{CounterCatalog, DiagnosticChannel, HostInfoSource, ProcessFacility, RelationalConnector};
use crate::store::Store;

/// Every external collaborator and backing store the Orchestrator needs.
/// Grouped into one struct so callers (the capture binary, or a test
/// harness) build it once and hand it over.
pub struct Collaborators {
    pub host_info: Arc<dyn HostInfoSource>,
    pub counters: Arc<dyn CounterCatalog>,
    pub process_facility: Arc<dyn ProcessFacility>,
    pub diagnostic_channel: Arc<dyn DiagnosticChannel>,
    pub relational_connector: Arc<dyn RelationalConnector>,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Convenience constructor using the production clock; tests typically
    /// build `Collaborators` directly with a `MockClock`.
    pub fn with_system_clock(
        host_info: Arc<dyn HostInfoSource>,
        counters: Arc<dyn CounterCatalog>,
        process_facility: Arc<dyn ProcessFacility>,
        diagnostic_channel: Arc<dyn DiagnosticChannel>,
        relational_connector: Arc<dyn RelationalConnector>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            host_info,
            counters,
            process_facility,
            diagnostic_channel,
            relational_connector,
            store,
            clock: Arc::new(SystemClock),
        }
    }
}

struct PreviousCpu {
    cpu_time_100ns: u64,
}

/// Drives one bounded capture run end to end. Construction opens the run
/// record and starts every configured component; `run` drives the master
/// tick loop until cancelled; `Drop` is not relied on for cleanup — callers
/// must call `shutdown` to flush and close the run cleanly.
pub struct Orchestrator {
    config: Config,
    collaborators: Collaborators,
    run_id: i64,
    started_at: std::time::Instant,

    process_tracker: Arc<ProcessLifecycleTracker>,
    runtime_host: Arc<ManagedRuntimeSessionHost>,
    classic_sampler: Arc<ClassicRuntimeSampler>,
    http_reconstructor: Arc<HttpReconstructor>,
    dmv_sampler: Option<Arc<DmvSampler>>,
    counter_reader: CounterReader,

    previous_cpu: std::sync::Mutex<HashMap<u32, PreviousCpu>>,
    cancelled: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl Orchestrator {
    /// Opens the run and constructs+starts C2 through C5 in the fixed order
    /// spec.md §4.6 step 3 requires (lifecycle tracker before runtime
    /// sessions before HTTP reconstructor before the DMV sampler), then
    /// invokes `AttachExisting` once arrival listeners are wired (step 4).
    pub fn start(config: Config, collaborators: Collaborators) -> Result<Self, CoreError> {
        let clock = Arc::clone(&collaborators.clock);
        let now = clock.now_utc_secs();

        let drive_status = collaborators.host_info.system_drive_status();

        let run = Run {
            id: None,
            start_timestamp: now,
            end_timestamp: None,
            duration_seconds: None,
            machine_name: std::env::var("COMPUTERNAME").unwrap_or_default(),
            os_identifier: std::env::consts::OS.to_string(),
            logical_core_count: collaborators.host_info.logical_core_count(),
            cpu_model: collaborators.host_info.cpu_model().unwrap_or_default(),
            total_physical_memory_mb: collaborators.host_info.memory_status().map(|m| m.total_physical_mb).unwrap_or(0),
            system_drive_type: drive_status.as_ref().map(|d| d.drive_type.clone()).unwrap_or_default(),
            system_drive_free_mb: drive_status.map(|d| d.free_mb).unwrap_or(0),
            uptime_seconds_at_start: collaborators.host_info.uptime_seconds(),
            scenario_label: String::new(),
            notes: String::new(),
            workload: Default::default(),
            captured_config: String::new(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let run_id = collaborators.store.insert_run(&run)?;

        let monitored_names = config.monitored_names();
        let process_tracker = ProcessLifecycleTracker::new(
            Arc::clone(&collaborators.process_facility),
            Arc::clone(&collaborators.store),
            Arc::clone(&clock),
            run_id,
            &monitored_names,
        );

        let runtime_host = ManagedRuntimeSessionHost::new(
            Arc::clone(&collaborators.diagnostic_channel),
            Arc::clone(&collaborators.store),
            Arc::clone(&clock),
            run_id,
            config.sample_interval(),
            config.deep_monitoring.core_apps.clone(),
        );

        let classic_sampler = ClassicRuntimeSampler::new(
            Arc::clone(&collaborators.counters),
            Arc::clone(&collaborators.process_facility),
            Arc::clone(&collaborators.store),
            Arc::clone(&clock),
            run_id,
            config.deep_monitoring.classic_apps.clone(),
        );

        let http_reconstructor = HttpReconstructor::new(
            Arc::clone(&collaborators.diagnostic_channel),
            Arc::clone(&collaborators.store),
            Arc::clone(&clock),
            run_id,
            config.deep_monitoring.core_apps.clone(),
        );

        let dmv_sampler = if config.dmv_enabled() {
            match config.dmv_connection_string() {
                Some(conn_str) => Some(DmvSampler::new(
                    Arc::clone(&collaborators.relational_connector),
                    Arc::clone(&collaborators.store),
                    Arc::clone(&clock),
                    run_id,
                    conn_str.to_string(),
                    config.deep_monitoring.dmv.sample_interval(),
                )),
                None => {
                    warn!("DMV monitoring enabled but no connection string configured; skipping");
                    None
                }
            }
        } else {
            None
        };

        process_tracker.add_listener(Arc::new(RuntimeArrivalListener(Arc::clone(&runtime_host))));
        process_tracker.add_listener(Arc::new(HttpReconstructorArrivalListener(Arc::clone(&http_reconstructor))));

        // `start()` seeds from the currently-running set (doubling as
        // AttachExisting for the two arrival listeners above) and then
        // subscribes to the OS start-event stream.
        process_tracker.start();
        if let Some(sampler) = &dmv_sampler {
            sampler.start();
        }

        let counter_reader = CounterReader::new(
            Arc::clone(&collaborators.counters),
            Arc::clone(&collaborators.host_info),
            config.enable_disk_metrics,
            config.enable_network_metrics,
        );

        info!("run {} started with {} monitored process name(s)", run_id, monitored_names.len());

        Ok(Self {
            config,
            collaborators,
            run_id,
            started_at: std::time::Instant::now(),
            process_tracker,
            runtime_host,
            classic_sampler,
            http_reconstructor,
            dmv_sampler,
            counter_reader,
            previous_cpu: std::sync::Mutex::new(HashMap::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_notify: Arc::new(Notify::new()),
        })
    }

    /// A clone-able cancellation flag the caller can trip from a signal
    /// handler, matching the teacher's `Arc<AtomicBool>` shutdown idiom
    /// (`rpglotd/src/main.rs`) layered with a `Notify` so `run` wakes
    /// immediately instead of waiting out the current tick.
    pub fn cancellation(&self) -> (Arc<AtomicBool>, Arc<Notify>) {
        (Arc::clone(&self.cancelled), Arc::clone(&self.cancel_notify))
    }

    /// Drives the master tick loop until cancelled, then tears every
    /// component down in reverse construction order and closes the run.
    pub async fn run(mut self) -> Result<(), CoreError> {
        let interval = self.config.sample_interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    self.tick().await;
                }
                _ = self.cancel_notify.notified() => {
                    break;
                }
            }
        }

        self.shutdown().await
    }

    async fn tick(&mut self) {
        let interval_seconds = self.config.sample_interval_seconds;

        let snapshot = self.counter_reader.snapshot(interval_seconds);
        let system_sample = SystemSample {
            id: None,
            run_id: self.run_id,
            timestamp: self.collaborators.clock.now_utc_secs(),
            cpu_total_percent: snapshot.cpu_total_percent,
            memory_in_use_mb: snapshot.memory_in_use_mb,
            memory_available_mb: snapshot.memory_available_mb,
            disk_reads_per_sec: snapshot.disk_reads_per_sec,
            disk_writes_per_sec: snapshot.disk_writes_per_sec,
            disk_read_bytes_per_sec: snapshot.disk_read_bytes_per_sec,
            disk_write_bytes_per_sec: snapshot.disk_write_bytes_per_sec,
            net_bytes_sent_per_sec: snapshot.net_bytes_sent_per_sec,
            net_bytes_received_per_sec: snapshot.net_bytes_received_per_sec,
        };

        let system_sample_id = match self.collaborators.store.insert_system_sample(&system_sample) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to write system sample: {}", e);
                return;
            }
        };

        let names = self.process_tracker.active_names();
        let handles = self.process_tracker.active_snapshot();
        let logical_cores = self.collaborators.host_info.logical_core_count();

        let mut groups: HashMap<String, ProcessSample> = HashMap::new();
        let mut seen_pids: std::collections::HashSet<u32> = std::collections::HashSet::new();

        {
            let mut previous = self.previous_cpu.lock().unwrap();

            for handle in &handles {
                let pid = handle.pid();
                let name = match names.get(&pid) {
                    Some(n) => n.clone(),
                    None => continue,
                };
                seen_pids.insert(pid);

                // Baseline is keyed by pid, not name: a new pid that reuses
                // a just-exited pid's name must still see no prior baseline
                // and get a true first-observation 0 (spec.md §4.2/§8).
                let prev_cpu = previous.get(&pid).map(|p| p.cpu_time_100ns);
                let cpu_now = handle.cpu_time_100ns().unwrap_or(0);
                let percent = cpu_percent(prev_cpu, cpu_now, interval_seconds, logical_cores);

                let entry = groups.entry(name.clone()).or_insert_with(|| ProcessSample {
                    id: None,
                    system_sample_id,
                    process_name: name.clone(),
                    cpu_percent: 0.0,
                    working_set_mb: 0.0,
                    private_bytes_mb: 0.0,
                    thread_count: 0,
                    handle_count: 0,
                });
                entry.cpu_percent += percent;
                entry.working_set_mb += handle.working_set_mb().unwrap_or(0.0);
                entry.private_bytes_mb += handle.private_bytes_mb().unwrap_or(0.0);
                entry.thread_count += handle.thread_count().unwrap_or(0);
                entry.handle_count += handle.handle_count().unwrap_or(0);

                previous.insert(pid, PreviousCpu { cpu_time_100ns: cpu_now });
            }

            previous.retain(|pid, _| seen_pids.contains(pid));
        }

        if !groups.is_empty() {
            let samples: Vec<ProcessSample> = groups.into_values().collect();
            if let Err(e) = self.collaborators.store.insert_process_samples(&samples) {
                warn!("failed to write process samples: {}", e);
            }
        }

        self.classic_sampler.tick();
        self.http_reconstructor.flush_once();
    }

    /// Stops every component in reverse order and closes the run (spec.md
    /// §4.6 step 6): C5, C4 (final flush), C3 (both variants), C2, then C1,
    /// then `update_run_end`.
    pub async fn shutdown(self) -> Result<(), CoreError> {
        if let Some(sampler) = &self.dmv_sampler {
            sampler.dispose();
        }
        self.http_reconstructor.dispose();
        self.runtime_host.dispose();
        self.process_tracker.dispose();
        self.counter_reader.close();

        let elapsed = self.started_at.elapsed().as_secs_f64();
        let end = self.collaborators.clock.now_utc_secs();
        self.collaborators.store.update_run_end(self.run_id, end, elapsed)?;

        info!("run {} ended after {:.1}s", self.run_id, elapsed);
        Ok(())
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::ManagedAppConfig;
    use crate::os::{MockCounterCatalog, MockDiagnosticChannel, MockHostInfoSource, MockProcessFacility, MockRelationalConnector};
    use crate::store::SqliteStore;

    fn collaborators_with(facility: MockProcessFacility, clock: Arc<MockClock>, store: Arc<SqliteStore>) -> Collaborators {
        Collaborators {
            host_info: Arc::new(MockHostInfoSource::default()),
            counters: Arc::new(MockCounterCatalog::new()),
            process_facility: Arc::new(facility),
            diagnostic_channel: Arc::new(MockDiagnosticChannel::new()),
            relational_connector: Arc::new(MockRelationalConnector::new()),
            store,
            clock,
        }
    }

    #[tokio::test]
    async fn start_opens_a_run_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let clock = Arc::new(MockClock::new(1_000));
        let facility = MockProcessFacility::new(vec![]);
        let collaborators = collaborators_with(facility, clock, store);

        let mut config = Config::default();
        config.database_path = dir.path().join("t.db").to_str().unwrap().to_string();

        let orchestrator = Orchestrator::start(config, collaborators).unwrap();
        assert!(orchestrator.run_id() > 0);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dmv_sampler_is_absent_when_no_connection_string_configured() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let clock = Arc::new(MockClock::new(1_000));
        let facility = MockProcessFacility::new(vec![]);
        let collaborators = collaborators_with(facility, clock, store);

        let mut config = Config::default();
        config.deep_monitoring.dmv.enabled = true;

        let orchestrator = Orchestrator::start(config, collaborators).unwrap();
        assert!(orchestrator.dmv_sampler.is_none());
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn monitored_names_include_configured_core_apps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let clock = Arc::new(MockClock::new(1_000));
        let facility = MockProcessFacility::new(vec![(10, "api.exe".to_string())]);
        let collaborators = collaborators_with(facility, clock, store);

        let mut config = Config::default();
        config.deep_monitoring.core_apps.push(ManagedAppConfig::new("API", "api.exe"));

        let orchestrator = Orchestrator::start(config, collaborators).unwrap();
        assert!(!orchestrator.process_tracker.active_snapshot().is_empty());
        orchestrator.shutdown().await.unwrap();
    }
}
