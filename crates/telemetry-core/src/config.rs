//! Flat configuration surface (spec.md §6.3).
//!
//! Parsing these structs out of a config file or CLI flags is explicitly out
//! of scope (spec.md §1) — callers build a `Config` however they like and
//! hand it to the `Orchestrator`. What *is* in scope is the merge rule
//! between a file-sourced and a CLI-sourced config (spec.md §6.3's "Merge
//! rule"), since that is data-layer logic the capture core owns.

use std::collections::HashSet;
use std::time::Duration;

/// Top-level capture configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub sample_interval_seconds: f64,
    pub process_names: HashSet<String>,
    pub enable_disk_metrics: bool,
    pub enable_network_metrics: bool,
    /// Legacy/top-level SQL connection string, superseded by
    /// `deep_monitoring.dmv.connection_string` when the latter is present
    /// (see DESIGN.md: Open Question on the two connection-string fields).
    pub sql_connection_string: Option<String>,
    pub enable_db_counters: bool,
    pub db_connection_string: Option<String>,
    pub deep_monitoring: DeepMonitoringConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: String::new(),
            sample_interval_seconds: 1.0,
            process_names: HashSet::new(),
            enable_disk_metrics: true,
            enable_network_metrics: false,
            sql_connection_string: None,
            enable_db_counters: false,
            db_connection_string: None,
            deep_monitoring: DeepMonitoringConfig::default(),
        }
    }
}

impl Config {
    pub fn sample_interval(&self) -> Duration {
        secs_to_duration(self.sample_interval_seconds)
    }

    /// The DMV sampler is started only "if enabled and a connection string is
    /// present" (spec.md §4.6 step 3). The nested `deep_monitoring.dmv` block
    /// is authoritative; the top-level `enable_db_counters` /
    /// `db_connection_string` pair is consulted only as a fallback so the
    /// flat options remain meaningful on their own.
    pub fn dmv_enabled(&self) -> bool {
        self.deep_monitoring.dmv.enabled || self.enable_db_counters
    }

    pub fn dmv_connection_string(&self) -> Option<&str> {
        self.deep_monitoring
            .dmv
            .connection_string
            .as_deref()
            .or(self.db_connection_string.as_deref())
            .or(self.sql_connection_string.as_deref())
    }

    /// Monitored-name set = union of plain process names and the process
    /// names of *all* managed-app entries, enabled or not (spec.md §9 open
    /// question — the ambiguity is preserved verbatim, see DESIGN.md).
    pub fn monitored_names(&self) -> HashSet<String> {
        let mut names = self.process_names.clone();
        for app in &self.deep_monitoring.core_apps {
            names.insert(app.process_name.clone());
        }
        for app in &self.deep_monitoring.classic_apps {
            names.insert(app.process_name.clone());
        }
        names
    }

    /// Merges an override config over this one (`self` is the baseline,
    /// typically file-sourced; `override_cfg` is typically CLI-sourced).
    ///
    /// Rule (spec.md §6.3): scalar override wins if present/non-default;
    /// list override replaces baseline only if non-empty; boolean toggles OR
    /// together; the DMV interval defaults to baseline if override is ≤0.
    pub fn merge(&self, override_cfg: &Config) -> Config {
        let default_cfg = Config::default();

        let database_path = if override_cfg.database_path.is_empty() {
            self.database_path.clone()
        } else {
            override_cfg.database_path.clone()
        };

        let sample_interval_seconds =
            if override_cfg.sample_interval_seconds != default_cfg.sample_interval_seconds {
                override_cfg.sample_interval_seconds
            } else {
                self.sample_interval_seconds
            };

        let process_names = if override_cfg.process_names.is_empty() {
            self.process_names.clone()
        } else {
            override_cfg.process_names.clone()
        };

        Config {
            database_path,
            sample_interval_seconds,
            process_names,
            enable_disk_metrics: self.enable_disk_metrics || override_cfg.enable_disk_metrics,
            enable_network_metrics: self.enable_network_metrics
                || override_cfg.enable_network_metrics,
            sql_connection_string: override_cfg
                .sql_connection_string
                .clone()
                .or_else(|| self.sql_connection_string.clone()),
            enable_db_counters: self.enable_db_counters || override_cfg.enable_db_counters,
            db_connection_string: override_cfg
                .db_connection_string
                .clone()
                .or_else(|| self.db_connection_string.clone()),
            deep_monitoring: self.deep_monitoring.merge(&override_cfg.deep_monitoring),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeepMonitoringConfig {
    pub core_apps: Vec<ManagedAppConfig>,
    pub classic_apps: Vec<ManagedAppConfig>,
    pub dmv: DmvConfig,
}

impl DeepMonitoringConfig {
    fn merge(&self, override_cfg: &DeepMonitoringConfig) -> DeepMonitoringConfig {
        DeepMonitoringConfig {
            core_apps: if override_cfg.core_apps.is_empty() {
                self.core_apps.clone()
            } else {
                override_cfg.core_apps.clone()
            },
            classic_apps: if override_cfg.classic_apps.is_empty() {
                self.classic_apps.clone()
            } else {
                override_cfg.classic_apps.clone()
            },
            dmv: self.dmv.merge(&override_cfg.dmv),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DmvConfig {
    pub enabled: bool,
    pub sample_interval_seconds: f64,
    pub connection_string: Option<String>,
}

impl Default for DmvConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_interval_seconds: 5.0,
            connection_string: None,
        }
    }
}

impl DmvConfig {
    pub fn sample_interval(&self) -> Duration {
        secs_to_duration(self.sample_interval_seconds)
    }

    fn merge(&self, override_cfg: &DmvConfig) -> DmvConfig {
        let sample_interval_seconds = if override_cfg.sample_interval_seconds <= 0.0 {
            self.sample_interval_seconds
        } else {
            override_cfg.sample_interval_seconds
        };

        DmvConfig {
            enabled: self.enabled || override_cfg.enabled,
            sample_interval_seconds,
            connection_string: override_cfg
                .connection_string
                .clone()
                .or_else(|| self.connection_string.clone()),
        }
    }
}

/// One entry of `deep_monitoring.{core,classic}_apps`.
#[derive(Debug, Clone)]
pub struct ManagedAppConfig {
    pub name: String,
    pub process_name: String,
    pub enabled: bool,
    /// Only meaningful for core-runtime apps; `None` for classic apps.
    pub http_monitoring: Option<HttpMonitoringConfig>,
}

impl ManagedAppConfig {
    pub fn new(name: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            process_name: process_name.into(),
            enabled: true,
            http_monitoring: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointGrouping {
    HostOnly,
    HostAndFirstPathSegment,
}

impl Default for EndpointGrouping {
    fn default() -> Self {
        EndpointGrouping::HostOnly
    }
}

#[derive(Debug, Clone)]
pub struct HttpMonitoringConfig {
    pub enabled: bool,
    pub endpoint_grouping: EndpointGrouping,
    pub bucket_interval_seconds: f64,
}

impl Default for HttpMonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint_grouping: EndpointGrouping::HostOnly,
            bucket_interval_seconds: 5.0,
        }
    }
}

impl HttpMonitoringConfig {
    pub fn bucket_interval(&self) -> Duration {
        secs_to_duration(self.bucket_interval_seconds)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    if secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_non_default_scalar_override() {
        let baseline = Config {
            sample_interval_seconds: 2.0,
            ..Config::default()
        };
        let override_cfg = Config::default(); // still at the default 1.0

        let merged = baseline.merge(&override_cfg);
        assert_eq!(merged.sample_interval_seconds, 2.0);
    }

    #[test]
    fn merge_empty_list_keeps_baseline() {
        let mut baseline = Config::default();
        baseline
            .process_names
            .insert("sqlservr".to_string());
        let override_cfg = Config::default();

        let merged = baseline.merge(&override_cfg);
        assert!(merged.process_names.contains("sqlservr"));
    }

    #[test]
    fn merge_bools_or_together() {
        let baseline = Config {
            enable_network_metrics: false,
            ..Config::default()
        };
        let override_cfg = Config {
            enable_network_metrics: true,
            ..Config::default()
        };

        assert!(baseline.merge(&override_cfg).enable_network_metrics);
    }

    #[test]
    fn dmv_interval_defaults_to_baseline_when_override_non_positive() {
        let mut baseline = Config::default();
        baseline.deep_monitoring.dmv.sample_interval_seconds = 10.0;
        let mut override_cfg = Config::default();
        override_cfg.deep_monitoring.dmv.sample_interval_seconds = 0.0;

        let merged = baseline.merge(&override_cfg);
        assert_eq!(merged.deep_monitoring.dmv.sample_interval_seconds, 10.0);
    }

    #[test]
    fn monitored_names_includes_disabled_apps() {
        let mut cfg = Config::default();
        let mut app = ManagedAppConfig::new("API", "api.exe");
        app.enabled = false;
        cfg.deep_monitoring.core_apps.push(app);

        assert!(cfg.monitored_names().contains("api.exe"));
    }
}
