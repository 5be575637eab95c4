//! Managed Runtime Session (C3, spec.md §4.3): one diagnostic session per
//! attached pid for `Core` apps, plus the classic polling variant for
//! `Framework` apps that have no diagnostic channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ManagedAppConfig;
use crate::model::{ManagedRuntimeSample, RuntimeKind};
use crate::os::{CounterCatalog, DiagnosticChannel, DiagnosticEvent, PayloadValue, Provider};
use crate::store::Store;
use crate::util::normalize_process_name;

use super::process_tracker::ArrivalListener;

const EMIT_SLACK: Duration = Duration::from_millis(200);

/// Hosts one diagnostic session per attached pid for the `Core`-kind apps.
/// At-most-once attachment is guaranteed by `attach_map`'s atomic
/// insert-if-absent (spec.md §4.3).
pub struct ManagedRuntimeSessionHost {
    channel: Arc<dyn DiagnosticChannel>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    run_id: i64,
    tick_interval: Duration,
    apps: Vec<ManagedAppConfig>,
    attach_map: DashMap<u32, ()>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ManagedRuntimeSessionHost {
    pub fn new(
        channel: Arc<dyn DiagnosticChannel>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        run_id: i64,
        tick_interval: Duration,
        apps: Vec<ManagedAppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            store,
            clock,
            run_id,
            tick_interval,
            apps: apps.into_iter().filter(|a| a.enabled).collect(),
            attach_map: DashMap::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Enumerates current processes matching each configured app and
    /// attempts to attach to each (spec.md §4.3 `AttachExisting`).
    pub fn attach_existing(self: &Arc<Self>, facility: &dyn crate::os::ProcessFacility) {
        for (pid, name) in facility.enumerate() {
            self.try_attach(pid, &name);
        }
    }

    pub fn try_attach(self: &Arc<Self>, pid: u32, name: &str) {
        let normalized = normalize_process_name(name);
        let app = match self.apps.iter().find(|a| normalize_process_name(&a.process_name) == normalized) {
            Some(app) => app.clone(),
            None => return,
        };

        // Atomic reserve-or-skip: guarantees at-most-once attachment per pid
        // across both AttachExisting and arrival notifications.
        if self.attach_map.insert(pid, ()).is_some() {
            return;
        }

        let this = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || this.run_session(pid, app));
        self.tasks.lock().unwrap().push(handle);
    }

    fn run_session(self: Arc<Self>, pid: u32, app: ManagedAppConfig) {
        let session = match self.channel.connect(pid, &[Provider::RuntimeCounters]) {
            Ok(s) => s,
            Err(e) => {
                warn!("attach failed for pid {} ({}): {}", pid, app.process_name, e);
                self.attach_map.remove(&pid);
                return;
            }
        };

        let mut session = session;
        let mut scratch: HashMap<String, PayloadValue> = HashMap::new();
        let mut last_emit = self.clock.now_instant();

        loop {
            match session.recv() {
                Some(event) => {
                    self.apply_counters_event(&event, &mut scratch);

                    let elapsed = self.clock.now_instant().saturating_duration_since(last_emit);
                    if elapsed + EMIT_SLACK >= self.tick_interval {
                        self.emit_sample(&app, &scratch);
                        last_emit = self.clock.now_instant();
                    }
                }
                None => break,
            }
        }

        session.close();
        self.attach_map.remove(&pid);
    }

    fn apply_counters_event(&self, event: &DiagnosticEvent, scratch: &mut HashMap<String, PayloadValue>) {
        // Rate gauges carry a mean value; cumulative counters carry an
        // increment. Either way the latest value per name is what matters
        // for the next emitted sample (spec.md §4.3 step 2).
        let value = event.get("Mean").or_else(|| event.get("Increment")).or_else(|| event.get("Value"));
        if let Some(value) = value {
            scratch.insert(event.name.clone(), value.clone());
        }
    }

    fn emit_sample(&self, app: &ManagedAppConfig, scratch: &HashMap<String, PayloadValue>) {
        let get = |name: &str| scratch.get(name).and_then(PayloadValue::as_f64).unwrap_or(0.0);

        let sample = ManagedRuntimeSample {
            id: None,
            run_id: self.run_id,
            timestamp: self.clock.now_utc_secs(),
            app_label: app.name.clone(),
            process_name: app.process_name.clone(),
            runtime_kind: RuntimeKind::Core,
            heap_size_mb: get("gc-heap-size") / (1024.0 * 1024.0),
            allocation_rate_mb_per_sec: Some(get("alloc-rate") / (1024.0 * 1024.0)),
            gen0_collections_per_sec: get("gen-0-gc-count"),
            gen1_collections_per_sec: get("gen-1-gc-count"),
            gen2_collections_per_sec: get("gen-2-gc-count"),
            gc_time_percent: get("time-in-gc"),
            exception_rate: get("exception-count"),
            thread_count: get("threadpool-thread-count") as u64,
            thread_pool_thread_count: get("threadpool-thread-count") as u64,
            thread_pool_queue_length: get("threadpool-queue-length") as u64,
        };

        if let Err(e) = self.store.insert_managed_runtime_samples(std::slice::from_ref(&sample)) {
            warn!("failed to write managed runtime sample: {}", e);
        }
    }

    pub fn dispose(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Adapts a `ManagedRuntimeSessionHost` to `ArrivalListener` (`try_attach`
/// needs `&Arc<Self>`, which a `&self` trait method can't reconstruct on
/// its own).
pub struct RuntimeSessionArrivalListener(pub Arc<ManagedRuntimeSessionHost>);

impl ArrivalListener for RuntimeSessionArrivalListener {
    fn on_process_started(&self, pid: u32, name: &str) {
        self.0.try_attach(pid, name);
    }
}

/// Classic-runtime (`Framework`-kind) sampler: a background polling loop,
/// since these runtimes expose no diagnostic channel (spec.md §4.3
/// "Variant: classic-runtime sampling").
pub struct ClassicRuntimeSampler {
    catalog: Arc<dyn CounterCatalog>,
    facility: Arc<dyn crate::os::ProcessFacility>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    run_id: i64,
    apps: Vec<ManagedAppConfig>,
    instance_cache: std::sync::Mutex<HashMap<u32, String>>,
}

impl ClassicRuntimeSampler {
    pub fn new(
        catalog: Arc<dyn CounterCatalog>,
        facility: Arc<dyn crate::os::ProcessFacility>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        run_id: i64,
        apps: Vec<ManagedAppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            facility,
            store,
            clock,
            run_id,
            apps: apps.into_iter().filter(|a| a.enabled).collect(),
            instance_cache: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn tick(&self) {
        if self.apps.is_empty() {
            return;
        }

        let live = self.facility.enumerate();
        let mut samples = Vec::new();

        for app in &self.apps {
            let normalized_target = normalize_process_name(&app.process_name);
            for (pid, name) in &live {
                if normalize_process_name(name) != normalized_target {
                    continue;
                }
                match self.read_sample(app, *pid) {
                    Some(sample) => samples.push(sample),
                    None => debug!("classic-runtime sample unavailable for pid {} ({})", pid, app.process_name),
                }
            }
        }

        if !samples.is_empty() {
            if let Err(e) = self.store.insert_managed_runtime_samples(&samples) {
                warn!("failed to write classic runtime samples: {}", e);
            }
        }
    }

    fn read_sample(&self, app: &ManagedAppConfig, pid: u32) -> Option<ManagedRuntimeSample> {
        let instance = self.resolve_instance(pid)?;

        let read = |category: &str, counter: &str| -> Option<f64> {
            let handle = self.catalog.open_counter(category, counter, Some(&instance)).ok()?;
            let value = self.catalog.read(&handle).ok();
            self.catalog.close(&handle);
            value
        };

        Some(ManagedRuntimeSample {
            id: None,
            run_id: self.run_id,
            timestamp: self.clock.now_utc_secs(),
            app_label: app.name.clone(),
            process_name: app.process_name.clone(),
            runtime_kind: RuntimeKind::Framework,
            heap_size_mb: read(".NET CLR Memory", "# Bytes in all Heaps")? / (1024.0 * 1024.0),
            allocation_rate_mb_per_sec: None,
            gen0_collections_per_sec: read(".NET CLR Memory", "# Gen 0 Collections").unwrap_or(0.0),
            gen1_collections_per_sec: read(".NET CLR Memory", "# Gen 1 Collections").unwrap_or(0.0),
            gen2_collections_per_sec: read(".NET CLR Memory", "# Gen 2 Collections").unwrap_or(0.0),
            gc_time_percent: read(".NET CLR Memory", "% Time in GC").unwrap_or(0.0),
            exception_rate: read(".NET CLR Memory", "# of Exceps Thrown / sec").unwrap_or(0.0),
            thread_count: read(".NET CLR LocksAndThreads", "# of current logical Threads").unwrap_or(0.0) as u64,
            thread_pool_thread_count: 0,
            thread_pool_queue_length: 0,
        })
    }

    fn resolve_instance(&self, pid: u32) -> Option<String> {
        if let Some(instance) = self.instance_cache.lock().unwrap().get(&pid) {
            return Some(instance.clone());
        }
        let instances = self.catalog.enumerate_instances(".NET CLR Memory").ok()?;
        let instance = instances.into_iter().find(|i| i.ends_with(&format!("#{}", pid)) || i == &pid.to_string())?;
        self.instance_cache.lock().unwrap().insert(pid, instance.clone());
        Some(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::ManagedAppConfig;
    use crate::os::{MockCounterCatalog, MockDiagnosticChannel, MockProcessFacility};
    use crate::store::SqliteStore;
    use std::collections::HashMap as StdHashMap;

    fn counters_event(name: &str, key: &str, value: f64) -> DiagnosticEvent {
        let mut payload = StdHashMap::new();
        payload.insert(key.to_string(), PayloadValue::Float(value));
        DiagnosticEvent {
            name: name.to_string(),
            payload,
            indexed: Vec::new(),
        }
    }

    #[test]
    fn at_most_once_attach_per_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let run_id = store.insert_run(&crate::model::Run::default()).unwrap();
        let channel = Arc::new(MockDiagnosticChannel::new());
        let clock = Arc::new(MockClock::new(0));
        let app = ManagedAppConfig::new("api", "app.exe");
        let host = ManagedRuntimeSessionHost::new(channel, store, clock, run_id, Duration::from_millis(250), vec![app]);

        let facility = MockProcessFacility::new(vec![(1, "app.exe".to_string())]);
        host.attach_existing(&facility);
        host.try_attach(1, "app.exe");

        assert_eq!(host.attach_map.len(), 1);
    }

    #[test]
    fn classic_sampler_skips_app_with_no_matching_process() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let run_id = store.insert_run(&crate::model::Run::default()).unwrap();
        let catalog = Arc::new(MockCounterCatalog::new());
        let facility = Arc::new(MockProcessFacility::new(vec![]));
        let clock = Arc::new(MockClock::new(0));
        let app = ManagedAppConfig::new("legacy", "legacy.exe");

        let sampler = ClassicRuntimeSampler::new(catalog, facility, store, clock, run_id, vec![app]);
        sampler.tick();
    }

    #[test]
    fn counters_event_value_fallback_order() {
        let host_event = counters_event("gc-heap-size", "Mean", 2048.0);
        let mut scratch = StdHashMap::new();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let run_id = store.insert_run(&crate::model::Run::default()).unwrap();
        let channel = Arc::new(MockDiagnosticChannel::new());
        let clock = Arc::new(MockClock::new(0));
        let host = ManagedRuntimeSessionHost::new(channel, store, clock, run_id, Duration::from_millis(250), vec![]);

        host.apply_counters_event(&host_event, &mut scratch);
        assert_eq!(scratch.get("gc-heap-size").unwrap().as_f64(), Some(2048.0));
    }
}
