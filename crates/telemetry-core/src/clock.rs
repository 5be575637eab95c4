//! Injectable clock so orphan-eviction and rate-derivation timing can be
//! exercised in tests without real sleeps.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Abstraction over wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Current UTC time as seconds since the epoch.
    fn now_utc_secs(&self) -> i64;
    /// A monotonic instant, used for interval math (never serialized).
    fn now_instant(&self) -> Instant;
}

/// Production clock backed by the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc_secs(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn now_instant(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock advanced explicitly by the test, rather than by real time
/// passing. `now_instant` is derived from a fixed base plus the accumulated
/// offset so `Duration` arithmetic against real `Instant`s keeps working.
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<Mutex<MockClockState>>,
}

struct MockClockState {
    utc_secs: i64,
    base: Instant,
    offset: Duration,
}

impl MockClock {
    pub fn new(start_utc_secs: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockClockState {
                utc_secs: start_utc_secs,
                base: Instant::now(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Advances both the UTC clock and the monotonic clock by `d`.
    pub fn advance(&self, d: Duration) {
        let mut state = self.inner.lock().unwrap();
        state.utc_secs += d.as_secs() as i64;
        state.offset += d;
    }
}

impl Clock for MockClock {
    fn now_utc_secs(&self) -> i64 {
        self.inner.lock().unwrap().utc_secs
    }

    fn now_instant(&self) -> Instant {
        let state = self.inner.lock().unwrap();
        state.base + state.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_both_axes() {
        let clock = MockClock::new(1_000);
        let t0 = clock.now_instant();
        assert_eq!(clock.now_utc_secs(), 1_000);

        clock.advance(Duration::from_secs(300));

        assert_eq!(clock.now_utc_secs(), 1_300);
        assert_eq!(clock.now_instant() - t0, Duration::from_secs(300));
    }
}
