//! Wall-clock source used for scheduling decisions.

use std::sync::{Arc, Mutex};

use time::{Duration, OffsetDateTime};

/// Provides the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Local system time, falling back to UTC when the offset is unknown.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        crate::logging::now_local_or_utc()
    }
}

/// Manually advanced clock for hosts that replay recorded timelines.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, value: OffsetDateTime) {
        if let Ok(mut guard) = self.now.lock() {
            *guard = value;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.lock() {
            *guard += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        self.now
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|err| *err.into_inner())
    }
}
