use std::sync::Mutex;

use time::{Duration, OffsetDateTime};

/// Wall-clock source for command timestamps and liveness checks.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Hand-driven clock for tests and replay tools.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, now: OffsetDateTime) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Smallest step used to order two writes that share a wall-clock reading.
pub const STAMP_STEP: Duration = Duration::milliseconds(1);

/// Timestamp for a write that supersedes `previous`: never before `now`, and
/// strictly after every previously committed stamp.
pub fn next_stamp(now: OffsetDateTime, previous: impl IntoIterator<Item = OffsetDateTime>) -> OffsetDateTime {
    previous
        .into_iter()
        .filter(|p| *p >= now)
        .max()
        .map_or(now, |latest| latest + STAMP_STEP)
}
