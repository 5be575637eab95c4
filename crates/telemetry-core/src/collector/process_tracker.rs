//! Process Lifecycle Tracker (C2, spec.md §4.2): maintains the live set of
//! monitored process ids, announces arrivals/departures, and exposes a
//! point-in-time snapshot of live handles to the Orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::Marker;
use crate::os::{ProcessFacility, ProcessHandle};
use crate::store::Store;
use crate::util::normalize_process_name;

/// Notified whenever a monitored process arrives; C3 and C4 each register
/// one to attach their respective sessions (spec.md §4.6 step 4).
pub trait ArrivalListener: Send + Sync {
    fn on_process_started(&self, pid: u32, name: &str);
}

struct SharedState {
    active: HashMap<u32, String>,
}

/// Maintains the monitored set. Inputs are compared case-insensitively with
/// extensions stripped (spec.md §4.2).
pub struct ProcessLifecycleTracker {
    facility: Arc<dyn ProcessFacility>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    run_id: i64,
    monitored: HashSet<String>,
    state: Mutex<SharedState>,
    listeners: Mutex<Vec<Arc<dyn ArrivalListener>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessLifecycleTracker {
    pub fn new(
        facility: Arc<dyn ProcessFacility>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        run_id: i64,
        monitored_names: &HashSet<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            facility,
            store,
            clock,
            run_id,
            monitored: monitored_names.iter().map(|n| normalize_process_name(n)).collect(),
            state: Mutex::new(SharedState { active: HashMap::new() }),
            listeners: Mutex::new(Vec::new()),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn add_listener(&self, listener: Arc<dyn ArrivalListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Seeds from currently-running processes, then subscribes to the
    /// OS-level start stream. Must run after listeners are registered
    /// (spec.md §4.6 step 4: "invoke AttachExisting once after subscription
    /// is in place" — here, seeding doubles as that invocation via arrival
    /// events).
    pub fn start(self: &Arc<Self>) {
        self.seed();

        let this = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || match this.facility.subscribe_starts() {
            Ok(mut watcher) => {
                while let Some((pid, name)) = watcher.recv() {
                    this.handle_arrival(pid, &name);
                }
            }
            Err(e) => {
                warn!("process start-event subscription failed, continuing seed-only: {}", e);
            }
        });
        self.background.lock().unwrap().push(handle);
    }

    fn seed(self: &Arc<Self>) {
        for (pid, name) in self.facility.enumerate() {
            self.handle_arrival(pid, &name);
        }
    }

    fn handle_arrival(self: &Arc<Self>, pid: u32, raw_name: &str) {
        let normalized = normalize_process_name(raw_name);
        if !self.monitored.contains(&normalized) {
            return;
        }

        let handle = {
            let mut state = self.state.lock().unwrap();
            if state.active.contains_key(&pid) {
                return;
            }
            let handle = match self.facility.open(pid) {
                Ok(h) => h,
                Err(e) => {
                    debug!("failed to open arriving process {}: {}", pid, e);
                    return;
                }
            };
            state.active.insert(pid, raw_name.to_string());

            let now = self.clock.now_utc_secs();
            if let Err(e) = self.store.insert_marker(&Marker::process_started(self.run_id, now, raw_name, pid)) {
                warn!("failed to write start marker: {}", e);
            }

            // Close the race where the process dies between spawn and
            // handler setup, before releasing the mutex (spec.md §4.2).
            if !handle.is_running() {
                state.active.remove(&pid);
                let code = handle.exit_code();
                drop(state);
                if let Err(e) = self.store.insert_marker(&Marker::process_exited(self.run_id, now, raw_name, pid, code)) {
                    warn!("failed to write exit marker: {}", e);
                }
                return;
            }
            handle
        };

        drop(handle);

        for listener in self.listeners.lock().unwrap().iter() {
            listener.on_process_started(pid, raw_name);
        }

        let watcher = self.facility.subscribe_exit(pid);
        let this = Arc::clone(self);
        let name = raw_name.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            watcher.wait();
            this.handle_exit(pid, &name);
        });
        self.background.lock().unwrap().push(handle);
    }

    fn handle_exit(&self, pid: u32, name: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if state.active.remove(&pid).is_none() {
                return;
            }
        }

        let code = self.facility.open(pid).ok().and_then(|h| h.exit_code());
        let now = self.clock.now_utc_secs();
        if let Err(e) = self.store.insert_marker(&Marker::process_exited(self.run_id, now, name, pid, code)) {
            warn!("failed to write exit marker: {}", e);
        }
    }

    /// A point-in-time copy of the pid -> raw name map, so the Orchestrator
    /// can group `active_snapshot`'s handles by name without re-deriving a
    /// name from the handle itself (spec.md §4.2 names are tracked, not
    /// queried per tick).
    pub fn active_names(&self) -> HashMap<u32, String> {
        self.state.lock().unwrap().active.clone()
    }

    /// A point-in-time copy of live process handles. The caller owns and
    /// must release each handle (spec.md §5).
    pub fn active_snapshot(&self) -> Vec<Box<dyn ProcessHandle>> {
        let pids: Vec<u32> = self.state.lock().unwrap().active.keys().copied().collect();
        let mut handles = Vec::with_capacity(pids.len());
        for pid in pids {
            match self.facility.open(pid) {
                Ok(h) => handles.push(h),
                Err(_) => {
                    self.state.lock().unwrap().active.remove(&pid);
                }
            }
        }
        handles
    }

    pub fn dispose(&self) {
        for handle in self.background.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

/// Per-pid CPU percent over interval `t` on a host with `logical_cores`
/// (spec.md §4.2): `(cpu_now - cpu_prev) / (t * cores) * 100`, clamped to
/// ≥0. Pure function kept alongside the tracker for locality even though
/// the Orchestrator owns the previous-sample state.
pub fn cpu_percent(cpu_time_100ns_prev: Option<u64>, cpu_time_100ns_now: u64, interval_seconds: f64, logical_cores: u32) -> f64 {
    let prev = match cpu_time_100ns_prev {
        Some(p) => p,
        None => return 0.0,
    };
    if interval_seconds <= 0.0 || logical_cores == 0 {
        return 0.0;
    }
    let delta_100ns = cpu_time_100ns_now.saturating_sub(prev) as f64;
    let delta_seconds = delta_100ns / 10_000_000.0;
    let percent = (delta_seconds / (interval_seconds * logical_cores as f64)) * 100.0;
    percent.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::os::MockProcessFacility;
    use crate::store::SqliteStore;

    fn tracker_with(monitored: &[&str], facility: MockProcessFacility) -> (Arc<ProcessLifecycleTracker>, Arc<SqliteStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let run_id = store.insert_run(&crate::model::Run::default()).unwrap();
        let monitored_names: HashSet<String> = monitored.iter().map(|s| s.to_string()).collect();
        let clock = Arc::new(MockClock::new(1_000));
        let tracker = ProcessLifecycleTracker::new(Arc::new(facility), store.clone(), clock, run_id, &monitored_names);
        (tracker, store, dir)
    }

    #[tokio::test]
    async fn seeding_matches_monitored_names_case_insensitively_and_strips_extension() {
        let facility = MockProcessFacility::new(vec![(100, "Child.EXE".to_string()), (200, "other.exe".to_string())]);
        let (tracker, _store, _dir) = tracker_with(&["child"], facility);
        tracker.seed();

        let snapshot = tracker.active_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].pid(), 100);
    }

    #[tokio::test]
    async fn process_dying_between_arrival_and_handler_setup_emits_both_markers() {
        let facility = MockProcessFacility::new(vec![(100, "child.exe".to_string())]);
        facility.exit(100, Some(0));
        let (tracker, _store, _dir) = tracker_with(&["child"], facility);
        tracker.seed();

        assert!(tracker.active_snapshot().is_empty());
    }

    #[test]
    fn cpu_percent_is_zero_for_first_observation() {
        assert_eq!(cpu_percent(None, 1_000_000, 1.0, 4), 0.0);
    }

    #[test]
    fn cpu_percent_matches_formula() {
        // 1 second of CPU time (10,000,000 * 100ns ticks) over a 1s interval
        // on 1 core is 100%.
        let v = cpu_percent(Some(0), 10_000_000, 1.0, 1);
        assert!((v - 100.0).abs() < 1e-6);
    }

    #[test]
    fn cpu_percent_never_negative() {
        let v = cpu_percent(Some(10_000_000), 0, 1.0, 1);
        assert_eq!(v, 0.0);
    }
}
