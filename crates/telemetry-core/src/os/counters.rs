//! OS performance counter catalog (spec.md §6.1): open a counter by
//! (category, counter, instance), enumerate instances of a category, read a
//! rate since the previous read. The substrate under the Counter Reader (C1)
//! and the classic-runtime variant of C3.

use std::fmt;

#[derive(Debug)]
pub enum CounterError {
    Open(String),
    Enumerate(String),
    Read(String),
}

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterError::Open(msg) => write!(f, "failed to open counter: {}", msg),
            CounterError::Enumerate(msg) => write!(f, "failed to enumerate instances: {}", msg),
            CounterError::Read(msg) => write!(f, "failed to read counter: {}", msg),
        }
    }
}

impl std::error::Error for CounterError {}

/// Opaque handle to an opened counter. Stateful: the underlying PDH query
/// must be collected once (primed) before its first meaningful read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CounterHandle(pub u64);

pub trait CounterCatalog: Send + Sync {
    fn open_counter(&self, category: &str, counter: &str, instance: Option<&str>) -> Result<CounterHandle, CounterError>;
    fn enumerate_instances(&self, category: &str) -> Result<Vec<String>, CounterError>;
    /// A discard read: primes the counter so the next `read` reports a rate.
    fn collect(&self, handle: &CounterHandle) -> Result<(), CounterError>;
    fn read(&self, handle: &CounterHandle) -> Result<f64, CounterError>;
    fn close(&self, handle: &CounterHandle);
}

#[cfg(windows)]
pub use real::RealCounterCatalog;

#[cfg(windows)]
mod real {
    use super::{CounterCatalog, CounterError, CounterHandle};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::ERROR_SUCCESS;
    use windows::Win32::System::Performance::{
        PdhAddCounterW, PdhCloseQuery, PdhCollectQueryData, PdhEnumObjectItemsW, PdhGetFormattedCounterValue, PdhOpenQueryW,
        PDH_FMT_COUNTERVALUE, PDH_FMT_DOUBLE, PDH_HCOUNTER, PDH_HQUERY, PERF_DETAIL_WIZARD,
    };

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Splits a Win32 double-null-terminated `MULTI_SZ` wide-char buffer
    /// into owned strings, as returned by `PdhEnumObjectItemsW`'s instance
    /// list.
    fn split_multi_sz(buf: &[u16]) -> Vec<String> {
        buf.split(|&c| c == 0)
            .filter(|segment| !segment.is_empty())
            .map(String::from_utf16_lossy)
            .collect()
    }

    struct OpenCounter {
        query: PDH_HQUERY,
        counter: PDH_HCOUNTER,
    }

    // SAFETY: PDH handles are only ever touched while holding `counters`'s
    // mutex in `RealCounterCatalog`.
    unsafe impl Send for OpenCounter {}
    unsafe impl Sync for OpenCounter {}

    /// Real PDH-backed catalog. Every open query/counter pair lives behind
    /// one mutex; PDH itself is not thread-safe for concurrent collects on
    /// the same query.
    pub struct RealCounterCatalog {
        next_id: AtomicU64,
        counters: Mutex<std::collections::HashMap<u64, OpenCounter>>,
    }

    impl Default for RealCounterCatalog {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RealCounterCatalog {
        pub fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                counters: Mutex::new(std::collections::HashMap::new()),
            }
        }

        fn full_path(category: &str, counter: &str, instance: Option<&str>) -> String {
            match instance {
                Some(inst) => format!("\\{}({})\\{}", category, inst, counter),
                None => format!("\\{}\\{}", category, counter),
            }
        }
    }

    impl CounterCatalog for RealCounterCatalog {
        fn open_counter(&self, category: &str, counter: &str, instance: Option<&str>) -> Result<CounterHandle, CounterError> {
            let path = Self::full_path(category, counter, instance);
            let wide_path = to_wide(&path);

            let mut query = PDH_HQUERY::default();
            // SAFETY: FFI call per the `windows` crate's PDH binding contract;
            // `query` is output-only until after this call succeeds.
            unsafe { PdhOpenQueryW(PCWSTR::null(), 0, &mut query) }
                .ok()
                .map_err(|e| CounterError::Open(format!("PdhOpenQueryW: {}", e)))?;

            let mut hcounter = PDH_HCOUNTER::default();
            let add_result = unsafe { PdhAddCounterW(query, PCWSTR(wide_path.as_ptr()), 0, &mut hcounter) };
            if let Err(e) = add_result.ok() {
                unsafe { PdhCloseQuery(query) }.ok().ok();
                return Err(CounterError::Open(format!("PdhAddCounterW({}): {}", path, e)));
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.counters.lock().unwrap().insert(id, OpenCounter { query, counter: hcounter });
            Ok(CounterHandle(id))
        }

        fn enumerate_instances(&self, category: &str) -> Result<Vec<String>, CounterError> {
            let wide_category = to_wide(category);

            // First call with zero-length buffers to learn the required
            // sizes; PDH returns PDH_MORE_DATA and writes the char counts.
            let mut counter_chars: u32 = 0;
            let mut instance_chars: u32 = 0;
            unsafe {
                let _ = PdhEnumObjectItemsW(
                    None,
                    PCWSTR::null(),
                    PCWSTR(wide_category.as_ptr()),
                    PCWSTR::null().0 as *mut u16,
                    &mut counter_chars,
                    PCWSTR::null().0 as *mut u16,
                    &mut instance_chars,
                    PERF_DETAIL_WIZARD,
                    0,
                );
            }

            if instance_chars == 0 {
                // No instances (a single-instance category, e.g. total CPU)
                // is not an error; it just means nothing to enumerate.
                return Ok(Vec::new());
            }

            let mut counter_buf = vec![0u16; counter_chars as usize];
            let mut instance_buf = vec![0u16; instance_chars as usize];
            let result = unsafe {
                PdhEnumObjectItemsW(
                    None,
                    PCWSTR::null(),
                    PCWSTR(wide_category.as_ptr()),
                    counter_buf.as_mut_ptr(),
                    &mut counter_chars,
                    instance_buf.as_mut_ptr(),
                    &mut instance_chars,
                    PERF_DETAIL_WIZARD,
                    0,
                )
            };
            if result != ERROR_SUCCESS {
                return Err(CounterError::Enumerate(format!("PdhEnumObjectItemsW({}): {:?}", category, result)));
            }

            Ok(split_multi_sz(&instance_buf))
        }

        fn collect(&self, handle: &CounterHandle) -> Result<(), CounterError> {
            let counters = self.counters.lock().unwrap();
            let open = counters
                .get(&handle.0)
                .ok_or_else(|| CounterError::Read("unknown counter handle".to_string()))?;
            unsafe { PdhCollectQueryData(open.query) }
                .ok()
                .map_err(|e| CounterError::Read(format!("PdhCollectQueryData: {}", e)))
        }

        fn read(&self, handle: &CounterHandle) -> Result<f64, CounterError> {
            let counters = self.counters.lock().unwrap();
            let open = counters
                .get(&handle.0)
                .ok_or_else(|| CounterError::Read("unknown counter handle".to_string()))?;

            let mut value = PDH_FMT_COUNTERVALUE::default();
            unsafe { PdhGetFormattedCounterValue(open.counter, PDH_FMT_DOUBLE, None, &mut value) }
                .ok()
                .map_err(|e| CounterError::Read(format!("PdhGetFormattedCounterValue: {}", e)))?;

            Ok(unsafe { value.Anonymous.doubleValue })
        }

        fn close(&self, handle: &CounterHandle) {
            if let Some(open) = self.counters.lock().unwrap().remove(&handle.0) {
                unsafe { PdhCloseQuery(open.query) }.ok().ok();
            }
        }
    }
}

/// Scripted catalog for tests (teacher precedent: `MockFs::add_file`'s
/// scripted-content idiom, generalized to a sequence of return values).
#[derive(Default)]
pub struct MockCounterCatalog {
    instances: std::sync::Mutex<std::collections::HashMap<String, Vec<String>>>,
    readings: std::sync::Mutex<std::collections::HashMap<u64, std::collections::VecDeque<Result<f64, String>>>>,
    next_id: std::sync::atomic::AtomicU64,
    fail_open: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl MockCounterCatalog {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn with_instances(self, category: &str, instances: Vec<String>) -> Self {
        self.instances.lock().unwrap().insert(category.to_string(), instances);
        self
    }

    pub fn with_readings(self, category: &str, counter: &str, instance: Option<&str>, values: Vec<Result<f64, String>>) -> Self {
        let key = Self::key(category, counter, instance);
        self.readings.lock().unwrap().insert(Self::key_hash(&key), values.into());
        self
    }

    pub fn failing_to_open(self, category: &str, counter: &str, instance: Option<&str>) -> Self {
        self.fail_open.lock().unwrap().insert(Self::key(category, counter, instance));
        self
    }

    fn key(category: &str, counter: &str, instance: Option<&str>) -> String {
        format!("{}/{}/{}", category, counter, instance.unwrap_or(""))
    }

    fn key_hash(key: &str) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl CounterCatalog for MockCounterCatalog {
    fn open_counter(&self, category: &str, counter: &str, instance: Option<&str>) -> Result<CounterHandle, CounterError> {
        let key = Self::key(category, counter, instance);
        if self.fail_open.lock().unwrap().contains(&key) {
            return Err(CounterError::Open(key));
        }
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.readings.lock().unwrap().entry(Self::key_hash(&key)).or_insert_with(|| vec![Ok(0.0)].into());
        // Re-key the readings entry under the handle id so concurrent opens
        // of the same (category, counter, instance) get independent cursors.
        let values = self.readings.lock().unwrap().remove(&Self::key_hash(&key)).unwrap_or_default();
        self.readings.lock().unwrap().insert(id, values);
        Ok(CounterHandle(id))
    }

    fn enumerate_instances(&self, category: &str) -> Result<Vec<String>, CounterError> {
        Ok(self.instances.lock().unwrap().get(category).cloned().unwrap_or_default())
    }

    fn collect(&self, _handle: &CounterHandle) -> Result<(), CounterError> {
        Ok(())
    }

    fn read(&self, handle: &CounterHandle) -> Result<f64, CounterError> {
        let mut readings = self.readings.lock().unwrap();
        let queue = readings.get_mut(&handle.0).ok_or_else(|| CounterError::Read("no scripted values".to_string()))?;
        queue
            .pop_front()
            .unwrap_or(Ok(0.0))
            .map_err(CounterError::Read)
    }

    fn close(&self, handle: &CounterHandle) {
        self.readings.lock().unwrap().remove(&handle.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_catalog_replays_scripted_values_in_order() {
        let catalog = MockCounterCatalog::new().with_readings("Processor", "% Processor Time", None, vec![Ok(10.0), Ok(20.0)]);
        let handle = catalog.open_counter("Processor", "% Processor Time", None).unwrap();
        assert_eq!(catalog.read(&handle).unwrap(), 10.0);
        assert_eq!(catalog.read(&handle).unwrap(), 20.0);
    }

    #[test]
    fn mock_catalog_fails_open_when_scripted() {
        let catalog = MockCounterCatalog::new().failing_to_open("PhysicalDisk", "Disk Reads/sec", Some("_Total"));
        assert!(catalog.open_counter("PhysicalDisk", "Disk Reads/sec", Some("_Total")).is_err());
    }

    #[test]
    fn mock_catalog_enumerates_scripted_instances() {
        let catalog = MockCounterCatalog::new().with_instances("Network Interface", vec!["eth0".to_string()]);
        assert_eq!(catalog.enumerate_instances("Network Interface").unwrap(), vec!["eth0".to_string()]);
    }
}
