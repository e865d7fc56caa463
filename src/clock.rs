//! Clock abstractions used by the limit engine and the admission pipeline.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Clock abstraction so timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock backed by `Utc::now()`.
///
/// Wall time is required here (not a monotonic instant) because bucket
/// boundaries are compared against the upstream's `Date` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now_millis: Arc::new(AtomicI64::new(start.timestamp_millis())) }
    }

    /// Move the clock forward by `millis`.
    pub fn advance_millis(&self, millis: i64) {
        self.now_millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        self.advance_millis(delta.num_milliseconds());
    }

    /// Jump to an absolute time.
    pub fn set(&self, at: DateTime<Utc>) {
        self.now_millis.store(at.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}
