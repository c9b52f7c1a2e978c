use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic wall clock, millisecond resolution.
pub trait Clock: Send + Sync {
    fn time_in_ms(&self) -> i64;
}

/// Clock pairing a monotonic [`Instant`] with the wall-clock offset captured
/// at construction, so `time_in_ms` is unix time but can never go backwards.
pub struct SystemClock {
    origin: Instant,
    unix_at_origin: Duration,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
            unix_at_origin: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_secs(0)),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn time_in_ms(&self) -> i64 {
        (self.unix_at_origin + self.origin.elapsed()).as_millis() as i64
    }
}

/// Hand-driven clock for tests.
#[derive(Default)]
pub struct ManualClock {
    now_ms: Mutex<i64>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        ManualClock {
            now_ms: Mutex::new(now_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        *crate::lock(&self.now_ms) += ms;
    }

    pub fn set(&self, now_ms: i64) {
        *crate::lock(&self.now_ms) = now_ms;
    }
}

impl Clock for ManualClock {
    fn time_in_ms(&self) -> i64 {
        *crate::lock(&self.now_ms)
    }
}
