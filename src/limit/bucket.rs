//! One quota window instance, tracked with atomics.

use crate::limit::{Admission, ScopeKey};
use crate::telemetry::BucketRetirement;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Share of the span after which a lower upstream count may mean a new window.
const REFRESH_FRACTION_PERMILLE: i64 = 800;

/// Accounting state of one window for one (scope, span).
///
/// Shape fields (`start`, `end_min`, `max`) are fixed at construction. The
/// remaining fields move monotonically: `count` and `latest_count` only grow,
/// `end_max` only shrinks and never drops below `end_min`. A bucket is never
/// reused once `end_max` has passed; the owning handler replaces it.
#[derive(Debug)]
pub struct Bucket {
    span: u32,
    start_ms: i64,
    end_min_ms: i64,
    refresh_ms: i64,
    end_max_ms: AtomicI64,
    max: u32,
    seeded: u32,
    count: AtomicU32,
    latest_count: AtomicU32,
    latest_ms: AtomicI64,
    blocked: AtomicBool,
    over_requests: AtomicU32,
}

/// Point-in-time copy of a bucket's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketSnapshot {
    pub span: u32,
    pub start: DateTime<Utc>,
    pub end_min: DateTime<Utc>,
    pub end_max: DateTime<Utc>,
    pub max: u32,
    pub count: u32,
    pub latest_count: u32,
    pub latest_timestamp: DateTime<Utc>,
    pub blocked: bool,
    pub over_requests: u32,
}

impl Bucket {
    /// Open a bucket believed to start at `start`.
    ///
    /// With `limit_share < 1` the count is pre-seeded to
    /// `floor((1 - share) * max) + 1` so this instance never claims more than
    /// its share of the window.
    pub fn open(
        start: DateTime<Utc>,
        span: u32,
        max: u32,
        limit_share: f64,
        end_padding: TimeDelta,
    ) -> Self {
        let seeded = seed_count(max, limit_share);
        let start_ms = to_millis(start);
        let end_min_ms = start_ms + i64::from(span) * 1_000;
        let end_max_ms = end_min_ms + end_padding.num_milliseconds().max(0);
        let refresh_ms = start_ms + i64::from(span) * REFRESH_FRACTION_PERMILLE;
        Self {
            span,
            start_ms,
            end_min_ms,
            refresh_ms,
            end_max_ms: AtomicI64::new(end_max_ms),
            max,
            seeded,
            count: AtomicU32::new(seeded),
            latest_count: AtomicU32::new(0),
            latest_ms: AtomicI64::new(start_ms),
            blocked: AtomicBool::new(seeded >= max),
            over_requests: AtomicU32::new(0),
        }
    }

    pub fn span(&self) -> u32 {
        self.span
    }

    pub fn start(&self) -> DateTime<Utc> {
        from_millis(self.start_ms)
    }

    /// Earliest moment the window can legitimately end.
    pub fn end_min(&self) -> DateTime<Utc> {
        from_millis(self.end_min_ms)
    }

    /// Latest moment the window can still be running.
    pub fn end_max(&self) -> DateTime<Utc> {
        from_millis(self.end_max_ms.load(Ordering::Acquire))
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Count the bucket was opened with (non-zero only under a limit share).
    pub fn seeded(&self) -> u32 {
        self.seeded
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn latest_count(&self) -> u32 {
        self.latest_count.load(Ordering::Acquire)
    }

    pub fn latest_timestamp(&self) -> DateTime<Utc> {
        from_millis(self.latest_ms.load(Ordering::Acquire))
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn over_requests(&self) -> u32 {
        self.over_requests.load(Ordering::Acquire)
    }

    /// True once `at` lies past `end_max`.
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        to_millis(at) > self.end_max_ms.load(Ordering::Acquire)
    }

    /// Earliest send time at which a lower upstream count is read as a reset.
    pub fn refreshable_at(&self) -> DateTime<Utc> {
        from_millis(self.refresh_ms)
    }

    /// True when `at` lies in `[end_min, end_max]`, where the window may or
    /// may not have ended.
    pub fn is_uncertain_at(&self, at: DateTime<Utc>) -> bool {
        let at = to_millis(at);
        at >= self.end_min_ms && at <= self.end_max_ms.load(Ordering::Acquire)
    }

    pub(crate) fn blocked_until(&self) -> Admission {
        Admission::Blocked { retry_at: self.end_max() }
    }

    pub(crate) fn record_over_request(&self) {
        self.over_requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one request. Refuses once the ceiling has been reached.
    pub(crate) fn try_count(&self) -> Admission {
        if self.is_blocked() {
            self.record_over_request();
            return self.blocked_until();
        }
        let max = self.max;
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| (c < max).then_some(c + 1))
        {
            Ok(previous) => {
                if previous + 1 >= max {
                    self.blocked.store(true, Ordering::Release);
                }
                Admission::Admitted
            }
            Err(_) => {
                self.blocked.store(true, Ordering::Release);
                self.record_over_request();
                self.blocked_until()
            }
        }
    }

    /// Raise the local count to `authoritative` if it is higher.
    ///
    /// Returns the previous local count when it was raised.
    pub(crate) fn raise_count(&self, authoritative: u32) -> Option<u32> {
        let previous = self.count.fetch_max(authoritative, Ordering::AcqRel);
        if authoritative >= self.max {
            self.blocked.store(true, Ordering::Release);
        }
        (authoritative > previous).then_some(previous)
    }

    /// Narrow `end_max` towards `candidate`, never below `end_min`.
    pub(crate) fn tighten_end(&self, candidate: DateTime<Utc>) {
        let candidate = to_millis(candidate).max(self.end_min_ms);
        self.end_max_ms.fetch_min(candidate, Ordering::AcqRel);
    }

    /// Adopt `(count, at)` as the freshest authoritative observation if it
    /// carries a higher count. Only called under the handler's lock.
    pub(crate) fn observe(&self, count: u32, at: DateTime<Utc>) -> bool {
        if count > self.latest_count() {
            self.latest_count.store(count, Ordering::Release);
            self.latest_ms.store(to_millis(at), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// A newer response reporting no more than the last seen count means the
    /// upstream counter started over, but only for requests sent once 80% of
    /// the span has passed. Earlier, a lower count is a reordered response
    /// from the same window.
    pub(crate) fn is_reset_by(
        &self,
        sent_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
        count: u32,
    ) -> bool {
        to_millis(sent_at) >= self.refresh_ms
            && to_millis(received_at) > self.latest_ms.load(Ordering::Acquire)
            && count <= self.latest_count()
    }

    /// A response that predates this bucket, or that is older than the latest
    /// observation without carrying a higher count, adds nothing.
    pub(crate) fn is_outdated(&self, received_at: DateTime<Utc>, count: u32) -> bool {
        let received = to_millis(received_at);
        received < self.start_ms
            || (received < self.latest_ms.load(Ordering::Acquire) && count <= self.latest_count())
    }

    /// Diagnostics emitted when this bucket is replaced by one starting at
    /// `next_start`.
    pub(crate) fn retirement(&self, scope: &ScopeKey, next_start: DateTime<Utc>) -> BucketRetirement {
        let end_max = self.end_max_ms.load(Ordering::Acquire);
        BucketRetirement {
            scope: scope.clone(),
            span: self.span,
            count: self.count(),
            max: self.max,
            dead_time: TimeDelta::milliseconds(end_max - self.end_min_ms),
            space_time: TimeDelta::milliseconds(to_millis(next_start) - end_max),
            over_requests: self.over_requests(),
        }
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            span: self.span,
            start: self.start(),
            end_min: self.end_min(),
            end_max: self.end_max(),
            max: self.max,
            count: self.count(),
            latest_count: self.latest_count(),
            latest_timestamp: self.latest_timestamp(),
            blocked: self.is_blocked(),
            over_requests: self.over_requests(),
        }
    }
}

fn seed_count(max: u32, limit_share: f64) -> u32 {
    if limit_share >= 1.0 {
        return 0;
    }
    let unshared = ((1.0 - limit_share.max(0.0)) * f64::from(max)).floor() as u32;
    unshared.saturating_add(1).min(max)
}
