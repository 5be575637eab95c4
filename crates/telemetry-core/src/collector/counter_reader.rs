//! Counter Reader (C1, spec.md §4.1): safe access to host and OS counters.
//! A single failing source never aborts a tick — every read degrades to an
//! absent field rather than an error escaping `snapshot`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::warn;

use crate::os::{CounterCatalog, CounterHandle, HostInfoSource};

/// One tick's worth of host/OS readings, mirrored onto `SystemSample` by the
/// Orchestrator.
#[derive(Clone, Debug, Default)]
pub struct SystemSnapshot {
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

struct NetInstanceCounters {
    sent: Option<CounterHandle>,
    received: Option<CounterHandle>,
}

/// Opens a fixed set of counters at construction and primes each with one
/// discard read (spec.md §4.1 "warm-up after one discard read"). Interface
/// enumeration happens once; interfaces appearing later in the run are not
/// captured (accepted limitation, spec.md §9).
pub struct CounterReader {
    catalog: Arc<dyn CounterCatalog>,
    host_info: Arc<dyn HostInfoSource>,

    cpu_total: Option<CounterHandle>,
    disk_reads: Option<CounterHandle>,
    disk_writes: Option<CounterHandle>,
    disk_read_bytes: Option<CounterHandle>,
    disk_write_bytes: Option<CounterHandle>,
    net_instances: Vec<NetInstanceCounters>,

    closed: AtomicBool,
}

impl CounterReader {
    pub fn new(catalog: Arc<dyn CounterCatalog>, host_info: Arc<dyn HostInfoSource>, enable_disk: bool, enable_network: bool) -> Self {
        let cpu_total = open_and_prime(&catalog, "Processor", "% Processor Time", Some("_Total"));

        let (disk_reads, disk_writes, disk_read_bytes, disk_write_bytes) = if enable_disk {
            (
                open_and_prime(&catalog, "PhysicalDisk", "Disk Reads/sec", Some("_Total")),
                open_and_prime(&catalog, "PhysicalDisk", "Disk Writes/sec", Some("_Total")),
                open_and_prime(&catalog, "PhysicalDisk", "Disk Read Bytes/sec", Some("_Total")),
                open_and_prime(&catalog, "PhysicalDisk", "Disk Write Bytes/sec", Some("_Total")),
            )
        } else {
            (None, None, None, None)
        };

        let net_instances = if enable_network {
            match catalog.enumerate_instances("Network Interface") {
                Ok(instances) => instances
                    .iter()
                    .map(|instance| NetInstanceCounters {
                        sent: open_and_prime(&catalog, "Network Interface", "Bytes Sent/sec", Some(instance)),
                        received: open_and_prime(&catalog, "Network Interface", "Bytes Received/sec", Some(instance)),
                    })
                    .collect(),
                Err(e) => {
                    warn!("failed to enumerate network interfaces: {}", e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        Self {
            catalog,
            host_info,
            cpu_total,
            disk_reads,
            disk_writes,
            disk_read_bytes,
            disk_write_bytes,
            net_instances,
            closed: AtomicBool::new(false),
        }
    }

    /// Reads every open counter. Per-counter failures yield absent values.
    /// `interval_seconds` is accepted for symmetry with the spec's operation
    /// signature; the counters themselves report an already-computed rate.
    pub fn snapshot(&self, _interval_seconds: f64) -> SystemSnapshot {
        let mut snapshot = SystemSnapshot {
            cpu_total_percent: self.read_one(&self.cpu_total),
            disk_reads_per_sec: self.read_one(&self.disk_reads),
            disk_writes_per_sec: self.read_one(&self.disk_writes),
            disk_read_bytes_per_sec: self.read_one(&self.disk_read_bytes),
            disk_write_bytes_per_sec: self.read_one(&self.disk_write_bytes),
            ..Default::default()
        };

        if !self.net_instances.is_empty() {
            let mut sent_sum = 0.0;
            let mut received_sum = 0.0;
            let mut any_sent = false;
            let mut any_received = false;
            for instance in &self.net_instances {
                if let Some(v) = self.read_one(&instance.sent) {
                    sent_sum += v;
                    any_sent = true;
                }
                if let Some(v) = self.read_one(&instance.received) {
                    received_sum += v;
                    any_received = true;
                }
            }
            snapshot.net_bytes_sent_per_sec = any_sent.then_some(sent_sum);
            snapshot.net_bytes_received_per_sec = any_received.then_some(received_sum);
        }

        match self.host_info.memory_status() {
            Some(status) => {
                snapshot.memory_available_mb = Some(status.available_physical_mb as f64);
                snapshot.memory_in_use_mb = Some((status.total_physical_mb.saturating_sub(status.available_physical_mb)) as f64);
            }
            None => {
                // Memory failure yields absent memory fields, never a
                // thrown error (spec.md §4.1).
            }
        }

        snapshot
    }

    fn read_one(&self, handle: &Option<CounterHandle>) -> Option<f64> {
        let handle = handle.as_ref()?;
        if let Err(e) = self.catalog.collect(handle) {
            tracing::debug!("counter collect failed: {}", e);
            return None;
        }
        match self.catalog.read(handle) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!("counter read failed: {}", e);
                None
            }
        }
    }

    /// Releases all counter resources. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in [&self.cpu_total, &self.disk_reads, &self.disk_writes, &self.disk_read_bytes, &self.disk_write_bytes]
            .into_iter()
            .flatten()
        {
            self.catalog.close(handle);
        }
        for instance in &self.net_instances {
            if let Some(h) = &instance.sent {
                self.catalog.close(h);
            }
            if let Some(h) = &instance.received {
                self.catalog.close(h);
            }
        }
    }
}

impl Drop for CounterReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_and_prime(catalog: &Arc<dyn CounterCatalog>, category: &str, counter: &str, instance: Option<&str>) -> Option<CounterHandle> {
    match catalog.open_counter(category, counter, instance) {
        Ok(handle) => {
            if let Err(e) = catalog.collect(&handle) {
                warn!("failed to prime counter {}/{}: {}", category, counter, e);
            }
            Some(handle)
        }
        Err(e) => {
            warn!("failed to open counter {}/{}: {}", category, counter, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::{MockCounterCatalog, MockHostInfoSource};

    #[test]
    fn snapshot_reports_absent_cpu_when_counter_fails_to_open() {
        let catalog = Arc::new(
            MockCounterCatalog::new()
                .failing_to_open("Processor", "% Processor Time", Some("_Total"))
                .with_readings("PhysicalDisk", "Disk Reads/sec", Some("_Total"), vec![Ok(5.0)])
                .with_readings("PhysicalDisk", "Disk Writes/sec", Some("_Total"), vec![Ok(2.0)])
                .with_readings("PhysicalDisk", "Disk Read Bytes/sec", Some("_Total"), vec![Ok(100.0)])
                .with_readings("PhysicalDisk", "Disk Write Bytes/sec", Some("_Total"), vec![Ok(50.0)]),
        );
        let host_info = Arc::new(MockHostInfoSource::default());
        let reader = CounterReader::new(catalog, host_info, true, false);

        let snapshot = reader.snapshot(1.0);
        assert!(snapshot.cpu_total_percent.is_none());
        assert_eq!(snapshot.disk_reads_per_sec, Some(5.0));
    }

    #[test]
    fn disabled_disk_metrics_open_no_disk_counters() {
        let catalog = Arc::new(MockCounterCatalog::new());
        let host_info = Arc::new(MockHostInfoSource::default());
        let reader = CounterReader::new(catalog, host_info, false, false);

        let snapshot = reader.snapshot(1.0);
        assert!(snapshot.disk_reads_per_sec.is_none());
        assert!(snapshot.disk_writes_per_sec.is_none());
    }

    #[test]
    fn disabled_network_metrics_enumerates_no_interfaces() {
        let catalog = Arc::new(MockCounterCatalog::new().with_instances("Network Interface", vec!["eth0".to_string()]));
        let host_info = Arc::new(MockHostInfoSource::default());
        let reader = CounterReader::new(catalog, host_info, true, false);

        let snapshot = reader.snapshot(1.0);
        assert!(snapshot.net_bytes_sent_per_sec.is_none());
    }

    #[test]
    fn memory_fields_come_from_host_info() {
        let catalog = Arc::new(MockCounterCatalog::new());
        let host_info = Arc::new(MockHostInfoSource::default());
        let reader = CounterReader::new(catalog, host_info, false, false);

        let snapshot = reader.snapshot(1.0);
        assert!(snapshot.memory_available_mb.is_some());
        assert!(snapshot.memory_in_use_mb.is_some());
    }

    #[test]
    fn close_is_idempotent() {
        let catalog = Arc::new(MockCounterCatalog::new());
        let host_info = Arc::new(MockHostInfoSource::default());
        let reader = CounterReader::new(catalog, host_info, true, true);
        reader.close();
        reader.close();
    }
}
