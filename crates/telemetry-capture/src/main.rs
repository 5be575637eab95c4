//! telemetry-capture - scenario telemetry capture daemon.
//!
//! Opens a run, wires the five capture components behind one clock and one
//! cancellation scope, and drives the master tick loop until interrupted.
//! Command-line parsing, config-file layering, and report generation are
//! out of scope (spec.md §1) - this binary exists to give the capture core
//! a runnable entry point, not to provide the tool's command surface.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_core::config::Config;
use telemetry_core::orchestrator::{Collaborators, Orchestrator};
use telemetry_core::os::{MockCounterCatalog, MockDiagnosticChannel, MockHostInfoSource, MockProcessFacility, MockRelationalConnector};
use telemetry_core::store::SqliteStore;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telemetry_capture=info,telemetry_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Builds the run configuration from environment variables. Config-file and
/// CLI layering belong to a collaborator outside this crate (spec.md §1);
/// what this binary does is the minimum needed to make a `Config` and hand
/// it to the `Orchestrator`.
fn config_from_env() -> Config {
    let mut config = Config::default();

    if let Ok(path) = std::env::var("TELEMETRY_DB_PATH") {
        config.database_path = path;
    } else {
        config.database_path = "telemetry-capture.db".to_string();
    }

    if let Ok(interval) = std::env::var("TELEMETRY_SAMPLE_INTERVAL_SECONDS") {
        if let Ok(v) = interval.parse::<f64>() {
            config.sample_interval_seconds = v;
        }
    }

    if let Ok(names) = std::env::var("TELEMETRY_PROCESS_NAMES") {
        config.process_names = names.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect::<HashSet<_>>();
    }

    config.enable_network_metrics = std::env::var("TELEMETRY_ENABLE_NETWORK").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);

    config.deep_monitoring.dmv.enabled = std::env::var("TELEMETRY_DMV_ENABLED").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    if let Ok(conn) = std::env::var("TELEMETRY_DMV_CONNECTION_STRING") {
        config.deep_monitoring.dmv.connection_string = Some(conn);
    }

    config
}

#[cfg(windows)]
fn real_collaborators(store: Arc<SqliteStore>) -> Collaborators {
    use telemetry_core::os::{RealCounterCatalog, RealDiagnosticChannel, RealHostInfoSource, RealProcessFacility, TiberiusConnector};

    Collaborators::with_system_clock(
        Arc::new(RealHostInfoSource::new()),
        Arc::new(RealCounterCatalog::new()),
        Arc::new(RealProcessFacility::new()),
        Arc::new(RealDiagnosticChannel::new()),
        Arc::new(TiberiusConnector::new()),
        store,
    )
}

/// Off-Windows fallback (this pack's Linux sandbox has no PDH/ETW/IPC/ODBC
/// surface to wrap), mirroring the teacher's `MockFs` fallback for
/// non-Linux builds of `rpglotd`.
#[cfg(not(windows))]
fn real_collaborators(store: Arc<SqliteStore>) -> Collaborators {
    warn!("non-Windows build: running against mock OS collaborators, no real telemetry will be captured");
    Collaborators::with_system_clock(
        Arc::new(MockHostInfoSource::default()),
        Arc::new(MockCounterCatalog::new()),
        Arc::new(MockProcessFacility::new(Vec::new())),
        Arc::new(MockDiagnosticChannel::new()),
        Arc::new(MockRelationalConnector::new()),
        store,
    )
}

#[tokio::main]
async fn main() {
    init_logging();
    info!("telemetry-capture {} starting", env!("CARGO_PKG_VERSION"));

    let config = config_from_env();

    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open store at {}: {}", config.database_path, e);
            std::process::exit(1);
        }
    };

    let collaborators = real_collaborators(store);

    let orchestrator = match Orchestrator::start(config, collaborators) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!("failed to start run: {}", e);
            std::process::exit(1);
        }
    };

    let (cancelled, notify) = orchestrator.cancellation();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        cancelled.store(true, Ordering::SeqCst);
        notify.notify_waiters();
    }) {
        warn!("failed to install Ctrl-C handler: {}", e);
    }

    if let Err(e) = orchestrator.run().await {
        error!("run ended with error: {}", e);
        std::process::exit(1);
    }

    info!("telemetry-capture exiting");
}
