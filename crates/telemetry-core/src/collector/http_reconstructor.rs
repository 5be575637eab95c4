//! HTTP Request Reconstructor (C4, spec.md §4.4): attaches to each Core
//! runtime app's HTTP diagnostic events, pairs request start/stop into
//! completed requests, and aggregates them into fixed-width time buckets
//! grouped by app and endpoint.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{EndpointGrouping, HttpMonitoringConfig, ManagedAppConfig};
use crate::model::{HttpSample, Marker};
use crate::os::{DiagnosticChannel, DiagnosticEvent, Provider};
use crate::store::Store;
use crate::util::normalize_process_name;

use super::process_tracker::ArrivalListener;

/// An orphaned in-flight request older than this is evicted and discarded
/// rather than aggregated, so a lost "stop" event can't pin memory forever
/// (spec.md §4.4).
const ORPHAN_THRESHOLD: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct AttachedApp {
    app_label: String,
    process_name: String,
    http: HttpMonitoringConfig,
}

struct ActiveRequest {
    start_instant: Instant,
    method: String,
    host: String,
    path: String,
}

#[derive(Clone, Default)]
struct BucketStats {
    request_count: u64,
    success_count: u64,
    client_error_count: u64,
    server_error_count: u64,
    other_status_count: u64,
    duration_count: u64,
    total_duration_ms: f64,
    min_duration_ms: f64,
    max_duration_ms: f64,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    bucket_start: i64,
    app_label: String,
    process_name: String,
    endpoint_group: String,
}

/// Reconstructs completed HTTP requests from paired diagnostic events and
/// aggregates them per bucket. One instance serves every attached Core app
/// in the run. At-most-once attachment per pid, mirroring the Managed
/// Runtime Session's `attach_map` pattern.
pub struct HttpReconstructor {
    channel: Arc<dyn DiagnosticChannel>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    run_id: i64,
    apps: Vec<ManagedAppConfig>,

    pid_apps: DashMap<u32, AttachedApp>,
    active: DashMap<u32, Mutex<HashMap<String, ActiveRequest>>>,
    buckets: Mutex<HashMap<BucketKey, BucketStats>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpReconstructor {
    /// `apps` should be the Core-kind managed apps; entries with HTTP
    /// monitoring disabled or absent are ignored at attach time.
    pub fn new(channel: Arc<dyn DiagnosticChannel>, store: Arc<dyn Store>, clock: Arc<dyn Clock>, run_id: i64, apps: Vec<ManagedAppConfig>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            store,
            clock,
            run_id,
            apps: apps.into_iter().filter(|a| a.enabled).collect(),
            pid_apps: DashMap::new(),
            active: DashMap::new(),
            buckets: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Enumerates current processes matching a configured app and attempts
    /// to attach to each (spec.md §4.6 step 4 `AttachExisting`).
    pub fn attach_existing(self: &Arc<Self>, facility: &dyn crate::os::ProcessFacility) {
        for (pid, name) in facility.enumerate() {
            self.try_attach(pid, &name);
        }
    }

    /// Attempts to attach if `name` matches a configured app with HTTP
    /// monitoring enabled. At-most-once per pid.
    pub fn try_attach(self: &Arc<Self>, pid: u32, name: &str) {
        let normalized = normalize_process_name(name);
        let matched = self.apps.iter().find(|a| normalize_process_name(&a.process_name) == normalized);
        let Some(app) = matched else {
            return;
        };
        let Some(http) = app.http_monitoring.clone().filter(|h| h.enabled) else {
            return;
        };

        if self.pid_apps.contains_key(&pid) {
            return;
        }
        self.pid_apps.insert(
            pid,
            AttachedApp {
                app_label: app.name.clone(),
                process_name: app.process_name.clone(),
                http,
            },
        );
        self.active.insert(pid, Mutex::new(HashMap::new()));

        let this = Arc::clone(self);
        let handle = tokio::task::spawn_blocking(move || this.run_session(pid));
        self.tasks.lock().unwrap().push(handle);
    }

    fn run_session(self: Arc<Self>, pid: u32) {
        let mut session = match self.channel.connect(pid, &[Provider::HttpEvents]) {
            Ok(s) => s,
            Err(e) => {
                let name = self.pid_apps.get(&pid).map(|a| a.process_name.clone()).unwrap_or_default();
                warn!("HTTP diagnostic attach failed for pid {} ({}): {}", pid, name, e);
                let now = self.clock.now_utc_secs();
                if let Err(write_err) =
                    self.store
                        .insert_marker(&Marker::tool_error(self.run_id, now, format!("HTTP attach failed for {} (PID {}): {}", name, pid, e)))
                {
                    warn!("failed to write tool-error marker: {}", write_err);
                }
                self.pid_apps.remove(&pid);
                self.active.remove(&pid);
                return;
            }
        };

        while let Some(event) = session.recv() {
            self.handle_event(pid, &event);
        }
        session.close();
    }

    /// Processes one diagnostic event for `pid`. Public so tests can drive
    /// events synchronously without a background session loop.
    pub fn handle_event(&self, pid: u32, event: &DiagnosticEvent) {
        let lower = event.name.to_ascii_lowercase();
        if lower.ends_with("start") {
            self.handle_start(pid, event);
        } else if lower.ends_with("stop") || lower.ends_with("failed") {
            self.handle_stop(pid, event);
        }
    }

    fn handle_start(&self, pid: u32, event: &DiagnosticEvent) {
        let Some(activity_id) = event.get("ActivityId").and_then(|v| v.as_str().map(str::to_string)) else {
            return;
        };
        let Some(active) = self.active.get(&pid) else {
            return;
        };
        let method = event.get("Method").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let host = event.get("Host").and_then(|v| v.as_str()).map(str::to_lowercase).unwrap_or_else(|| "(unknown)".to_string());
        let path = event.get("Path").and_then(|v| v.as_str()).unwrap_or("").to_string();
        active.lock().unwrap().insert(
            activity_id,
            ActiveRequest {
                start_instant: self.clock.now_instant(),
                method,
                host,
                path,
            },
        );
    }

    fn handle_stop(&self, pid: u32, event: &DiagnosticEvent) {
        let Some(activity_id) = event.get("ActivityId").and_then(|v| v.as_str().map(str::to_string)) else {
            return;
        };
        let Some(attached) = self.pid_apps.get(&pid).map(|a| a.clone()) else {
            return;
        };
        let Some(active) = self.active.get(&pid) else {
            return;
        };
        let request = active.lock().unwrap().remove(&activity_id);
        let Some(request) = request else {
            return;
        };

        let status = event.get("StatusCode").and_then(|v| v.as_i64()).unwrap_or(0);
        let duration_ms = event
            .get("Duration")
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| self.clock.now_instant().saturating_duration_since(request.start_instant).as_secs_f64() * 1000.0);

        let endpoint_group = match attached.http.endpoint_grouping {
            EndpointGrouping::HostOnly => request.host.clone(),
            EndpointGrouping::HostAndFirstPathSegment => format!("{}{}", request.host, first_path_segment(&request.path)),
        };

        let now = self.clock.now_utc_secs();
        let bucket_start = floor_bucket(now, attached.http.bucket_interval_seconds);

        let key = BucketKey {
            bucket_start,
            app_label: attached.app_label.clone(),
            process_name: attached.process_name.clone(),
            endpoint_group,
        };

        let mut buckets = self.buckets.lock().unwrap();
        let stats = buckets.entry(key).or_insert_with(BucketStats::default);
        stats.request_count += 1;
        match status {
            200..=299 => stats.success_count += 1,
            400..=499 => stats.client_error_count += 1,
            500..=599 => stats.server_error_count += 1,
            // 1xx and 3xx responses, and anything else outside the above
            // ranges, classify as "other" (spec.md §9 open question).
            _ => stats.other_status_count += 1,
        }
        if stats.duration_count == 0 {
            stats.min_duration_ms = duration_ms;
            stats.max_duration_ms = duration_ms;
        } else {
            stats.min_duration_ms = stats.min_duration_ms.min(duration_ms);
            stats.max_duration_ms = stats.max_duration_ms.max(duration_ms);
        }
        stats.duration_count += 1;
        stats.total_duration_ms += duration_ms;
    }

    /// Drains the bucket map into one `HttpSample` per bucket and sweeps
    /// every pid's active-request map for entries past the orphan
    /// threshold. Safe to call periodically from the Orchestrator's tick
    /// loop.
    pub fn flush_once(&self) {
        let drained: Vec<(BucketKey, BucketStats)> = {
            let mut buckets = self.buckets.lock().unwrap();
            std::mem::take(&mut *buckets).into_iter().collect()
        };

        if !drained.is_empty() {
            let samples: Vec<HttpSample> = drained
                .into_iter()
                .map(|(key, stats)| HttpSample {
                    id: None,
                    run_id: self.run_id,
                    bucket_start: key.bucket_start,
                    app_label: key.app_label,
                    process_name: key.process_name,
                    endpoint_group: key.endpoint_group,
                    request_count: stats.request_count,
                    success_count: stats.success_count,
                    client_error_count: stats.client_error_count,
                    server_error_count: stats.server_error_count,
                    other_status_count: stats.other_status_count,
                    total_duration_ms: stats.total_duration_ms,
                    avg_duration_ms: if stats.duration_count > 0 { stats.total_duration_ms / stats.duration_count as f64 } else { 0.0 },
                    min_duration_ms: stats.min_duration_ms,
                    max_duration_ms: stats.max_duration_ms,
                })
                .collect();
            if let Err(e) = self.store.insert_http_samples(&samples) {
                warn!("failed to write HTTP samples: {}", e);
            }
        }

        let now = self.clock.now_instant();
        let mut evicted = 0usize;
        for entry in self.active.iter() {
            let mut map = entry.value().lock().unwrap();
            let before = map.len();
            map.retain(|_, req| now.saturating_duration_since(req.start_instant) < ORPHAN_THRESHOLD);
            evicted += before - map.len();
        }
        if evicted > 0 {
            debug!("evicted {} orphaned in-flight HTTP requests", evicted);
        }
    }

    /// Aborts all background sessions, flushes one final time, then clears
    /// every pid's active-request map (spec.md §4.6 step 6).
    pub fn dispose(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.flush_once();
        for entry in self.active.iter() {
            entry.value().lock().unwrap().clear();
        }
    }
}

/// Adapts an `HttpReconstructor` to `ArrivalListener` (`try_attach` needs
/// `&Arc<Self>`, which a `&self` trait method can't reconstruct on its own).
pub struct HttpReconstructorArrivalListener(pub Arc<HttpReconstructor>);

impl ArrivalListener for HttpReconstructorArrivalListener {
    fn on_process_started(&self, pid: u32, name: &str) {
        self.0.try_attach(pid, name);
    }
}

fn floor_bucket(timestamp: i64, interval_seconds: f64) -> i64 {
    let interval = interval_seconds.max(1.0) as i64;
    (timestamp / interval) * interval
}

fn first_path_segment(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((first, _)) => format!("/{}", first),
        None if !trimmed.is_empty() => format!("/{}", trimmed),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::os::{MockDiagnosticChannel, MockProcessFacility, PayloadValue};
    use crate::store::SqliteStore;

    fn event(name: &str, pairs: &[(&str, &str)]) -> DiagnosticEvent {
        let mut payload = HashMap::new();
        for (k, v) in pairs {
            payload.insert(k.to_string(), PayloadValue::Str(v.to_string()));
        }
        DiagnosticEvent {
            name: name.to_string(),
            payload,
            indexed: Vec::new(),
        }
    }

    fn reconstructor_with(apps: Vec<ManagedAppConfig>) -> (Arc<HttpReconstructor>, Arc<SqliteStore>, tempfile::TempDir, Arc<MockClock>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let run_id = store.insert_run(&crate::model::Run::default()).unwrap();
        let clock = Arc::new(MockClock::new(1_000));
        let channel = Arc::new(MockDiagnosticChannel::new());
        let reconstructor = HttpReconstructor::new(channel, store.clone(), clock.clone(), run_id, apps);
        (reconstructor, store, dir, clock)
    }

    fn app_with_http(name: &str, process_name: &str) -> ManagedAppConfig {
        let mut app = ManagedAppConfig::new(name, process_name);
        app.http_monitoring = Some(HttpMonitoringConfig::default());
        app
    }

    #[test]
    fn attach_existing_skips_apps_without_http_monitoring() {
        let (reconstructor, _store, _dir, _clock) = reconstructor_with(vec![ManagedAppConfig::new("plain", "plain.exe")]);
        let facility = MockProcessFacility::new(vec![(1, "plain.exe".to_string())]);
        reconstructor.attach_existing(&facility);
        assert!(reconstructor.pid_apps.is_empty());
    }

    #[test]
    fn at_most_once_attach_per_pid() {
        let (reconstructor, _store, _dir, _clock) = reconstructor_with(vec![app_with_http("api", "api.exe")]);
        reconstructor.try_attach(1, "api.exe");
        reconstructor.try_attach(1, "api.exe");
        assert_eq!(reconstructor.pid_apps.len(), 1);
    }

    #[test]
    fn pairs_start_and_stop_into_one_bucketed_request() {
        let (reconstructor, _store, _dir, _clock) = reconstructor_with(vec![app_with_http("api", "api.exe")]);
        reconstructor.pid_apps.insert(
            42,
            AttachedApp {
                app_label: "api".to_string(),
                process_name: "api.exe".to_string(),
                http: HttpMonitoringConfig::default(),
            },
        );
        reconstructor.active.insert(42, Mutex::new(HashMap::new()));

        reconstructor.handle_event(42, &event("RequestStart", &[("ActivityId", "a1"), ("Host", "Example.com")]));
        reconstructor.handle_event(
            42,
            &event("RequestStop", &[("ActivityId", "a1"), ("StatusCode", "200"), ("Duration", "12.5"), ("Host", "Example.com")]),
        );

        let buckets = reconstructor.buckets.lock().unwrap();
        assert_eq!(buckets.len(), 1);
        let stats = buckets.values().next().unwrap();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.total_duration_ms, 12.5);
    }

    #[test]
    fn status_codes_classify_into_the_right_buckets() {
        let (reconstructor, _store, _dir, _clock) = reconstructor_with(vec![app_with_http("api", "api.exe")]);
        reconstructor.pid_apps.insert(
            1,
            AttachedApp {
                app_label: "api".to_string(),
                process_name: "api.exe".to_string(),
                http: HttpMonitoringConfig::default(),
            },
        );
        reconstructor.active.insert(1, Mutex::new(HashMap::new()));

        for (id, status) in [("a", "200"), ("b", "404"), ("c", "500"), ("d", "302")] {
            reconstructor.handle_event(1, &event("Start", &[("ActivityId", id)]));
            reconstructor.handle_event(1, &event("Stop", &[("ActivityId", id), ("StatusCode", status), ("Duration", "1.0")]));
        }

        let buckets = reconstructor.buckets.lock().unwrap();
        let stats = buckets.values().next().unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.client_error_count, 1);
        assert_eq!(stats.server_error_count, 1);
        assert_eq!(stats.other_status_count, 1);
    }

    #[test]
    fn flush_once_writes_samples_and_clears_buckets() {
        let (reconstructor, _store, _dir, _clock) = reconstructor_with(vec![app_with_http("api", "api.exe")]);
        reconstructor.pid_apps.insert(
            1,
            AttachedApp {
                app_label: "api".to_string(),
                process_name: "api.exe".to_string(),
                http: HttpMonitoringConfig::default(),
            },
        );
        reconstructor.active.insert(1, Mutex::new(HashMap::new()));
        reconstructor.handle_event(1, &event("Start", &[("ActivityId", "a1")]));
        reconstructor.handle_event(1, &event("Stop", &[("ActivityId", "a1"), ("StatusCode", "200"), ("Duration", "5.0")]));

        reconstructor.flush_once();
        assert!(reconstructor.buckets.lock().unwrap().is_empty());
    }

    #[test]
    fn orphaned_requests_are_evicted_after_threshold() {
        let (reconstructor, _store, _dir, clock) = reconstructor_with(vec![app_with_http("api", "api.exe")]);
        reconstructor.pid_apps.insert(
            1,
            AttachedApp {
                app_label: "api".to_string(),
                process_name: "api.exe".to_string(),
                http: HttpMonitoringConfig::default(),
            },
        );
        reconstructor.active.insert(1, Mutex::new(HashMap::new()));
        reconstructor.handle_event(1, &event("Start", &[("ActivityId", "orphan")]));

        clock.advance(ORPHAN_THRESHOLD + Duration::from_secs(1));
        reconstructor.flush_once();

        let active = reconstructor.active.get(&1).unwrap();
        assert!(active.lock().unwrap().is_empty());
        assert!(reconstructor.buckets.lock().unwrap().is_empty());
    }

    #[test]
    fn dispose_flushes_and_clears_active_requests() {
        let (reconstructor, _store, _dir, _clock) = reconstructor_with(vec![app_with_http("api", "api.exe")]);
        reconstructor.pid_apps.insert(
            1,
            AttachedApp {
                app_label: "api".to_string(),
                process_name: "api.exe".to_string(),
                http: HttpMonitoringConfig::default(),
            },
        );
        reconstructor.active.insert(1, Mutex::new(HashMap::new()));
        reconstructor.handle_event(1, &event("Start", &[("ActivityId", "a1")]));
        reconstructor.handle_event(1, &event("Stop", &[("ActivityId", "a1"), ("StatusCode", "200"), ("Duration", "3.0")]));
        reconstructor.handle_event(1, &event("Start", &[("ActivityId", "lingering")]));

        reconstructor.dispose();
        let active = reconstructor.active.get(&1).unwrap();
        assert!(active.lock().unwrap().is_empty());
    }

    #[test]
    fn first_path_segment_handles_root_and_nested_paths() {
        assert_eq!(first_path_segment("/"), "");
        assert_eq!(first_path_segment("/orders/123"), "/orders");
        assert_eq!(first_path_segment("/health"), "/health");
    }
}
