//! Per (scope, span) quota handler: permit acquisition, optimistic
//! accounting and authoritative reconciliation.

use crate::limit::{Admission, Bucket, BucketSnapshot, LimitError, LimitSettings, Permit, ScopeKey};
use crate::telemetry::{emit_best_effort, LimitEvent, NullSink, TelemetrySink};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Owns the live [`Bucket`] for one (region, scope, window span).
///
/// Reads of the live bucket are lock-free. Replacing it (first open, rollover
/// after `end_max`, or an upstream counter reset) happens under `rollover`,
/// so exactly one caller opens the successor while the others wait and then
/// reuse it. `update` runs entirely under the same lock; `add` and
/// `acquire_permit` against a live bucket never block each other.
#[derive(Debug)]
pub struct LimitHandler<S = NullSink> {
    scope: ScopeKey,
    span: u32,
    max: AtomicU32,
    limit_share: f64,
    end_padding: TimeDelta,
    bucket: ArcSwapOption<Bucket>,
    rollover: Mutex<()>,
    sink: S,
}

impl LimitHandler<NullSink> {
    /// Handler without telemetry.
    pub fn new(scope: ScopeKey, span: u32, declared_limit: u32, settings: &LimitSettings) -> Self {
        Self::with_sink(scope, span, declared_limit, settings, NullSink)
    }
}

impl<S: TelemetrySink> LimitHandler<S> {
    /// Handler for a span whose upstream-declared limit is `declared_limit`.
    ///
    /// No bucket exists until the first [`add`](Self::add) or
    /// [`update`](Self::update).
    pub fn with_sink(
        scope: ScopeKey,
        span: u32,
        declared_limit: u32,
        settings: &LimitSettings,
        sink: S,
    ) -> Self {
        Self {
            scope,
            span,
            max: AtomicU32::new(settings.effective_max(declared_limit)),
            limit_share: settings.limit_share,
            end_padding: settings.end_padding,
            bucket: ArcSwapOption::empty(),
            rollover: Mutex::new(()),
            sink,
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// Window span in seconds.
    pub fn span(&self) -> u32 {
        self.span
    }

    /// Ceiling applied to the next bucket opened.
    pub fn max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }

    /// Record a newly declared upstream limit; takes effect at the next bucket.
    pub(crate) fn set_max(&self, max: u32) {
        self.max.store(max, Ordering::Release);
    }

    pub fn has_bucket(&self) -> bool {
        self.bucket.load().is_some()
    }

    /// The live bucket, if any.
    pub fn current(&self) -> Option<Arc<Bucket>> {
        self.bucket.load_full()
    }

    pub fn snapshot(&self) -> Option<BucketSnapshot> {
        self.current().map(|bucket| bucket.snapshot())
    }

    /// Check whether a request planned at `planned_at` may use this handler.
    ///
    /// - past `end_max`: [`Permit::NextBucket`], the next `add` rolls over;
    /// - within `[end_min, end_max]`: blocked until `end_max`, since the
    ///   window may have ended but that cannot be proven yet;
    /// - otherwise granted unless the bucket is blocked.
    pub fn acquire_permit(&self, planned_at: DateTime<Utc>) -> Result<Permit, LimitError> {
        let bucket = self.current().ok_or_else(|| LimitError::BucketMissing {
            scope: self.scope.clone(),
            span: self.span,
        })?;

        if bucket.is_expired_at(planned_at) {
            return Ok(Permit::NextBucket);
        }
        if bucket.is_uncertain_at(planned_at) {
            return Ok(Permit::Blocked { retry_at: bucket.end_max() });
        }
        if bucket.is_blocked() {
            bucket.record_over_request();
            return Ok(Permit::Blocked { retry_at: bucket.end_max() });
        }
        Ok(Permit::Current)
    }

    /// Optimistically count one request planned at `planned_at`.
    ///
    /// Opens a fresh bucket first when none exists or the live one has
    /// expired. Refuses once the bucket's ceiling is reached.
    pub async fn add(&self, planned_at: DateTime<Utc>) -> Admission {
        let bucket = self.live_bucket(planned_at).await;
        bucket.try_count()
    }

    /// Fold in the authoritative `count` from a response to a request sent
    /// at `sent_at` and answered at `received_at`.
    ///
    /// A report sent past the bucket's refresh point with a newer timestamp
    /// and a count no higher than the last observed one opens a fresh bucket
    /// anchored at `sent_at`. Responses that predate the bucket, or that are older than its latest
    /// observation without carrying a higher count, are ignored. Otherwise
    /// `end_max` narrows to `received_at + span`, the observation is recorded
    /// and the local count is raised to the authoritative one.
    pub async fn update(&self, sent_at: DateTime<Utc>, received_at: DateTime<Utc>, count: u32) {
        let span = TimeDelta::seconds(i64::from(self.span));
        let mut events = Vec::new();
        {
            let _guard = self.rollover.lock().await;
            let (bucket, fresh) = match self.current() {
                Some(bucket)
                    if !bucket.is_reset_by(sent_at, received_at, count)
                        && !bucket.is_expired_at(sent_at) =>
                {
                    (bucket, false)
                }
                _ => {
                    let bucket = self.replace_bucket(sent_at, &mut events);
                    (bucket, true)
                }
            };

            if !fresh && bucket.is_outdated(received_at, count) {
                debug!(
                    target: "quotaguard::limit",
                    scope = %self.scope,
                    span = self.span,
                    count,
                    received_at = %received_at,
                    "ignoring outdated rate limit report"
                );
            } else {
                bucket.tighten_end(received_at + span);
                bucket.observe(count, received_at);
                if let Some(local) = bucket.raise_count(count) {
                    events.push(LimitEvent::Reconciled {
                        scope: self.scope.clone(),
                        span: self.span,
                        local,
                        authoritative: count,
                    });
                }
            }
        }

        for event in events {
            emit_best_effort(self.sink.clone(), event).await;
        }
    }

    /// Live bucket valid at `at`, opening a successor if needed.
    async fn live_bucket(&self, at: DateTime<Utc>) -> Arc<Bucket> {
        if let Some(bucket) = self.current().filter(|b| !b.is_expired_at(at)) {
            return bucket;
        }

        let mut events = Vec::new();
        let bucket = {
            let _guard = self.rollover.lock().await;
            // Another caller may have rolled over while we waited.
            match self.current().filter(|b| !b.is_expired_at(at)) {
                Some(bucket) => bucket,
                None => self.replace_bucket(at, &mut events),
            }
        };

        for event in events {
            emit_best_effort(self.sink.clone(), event).await;
        }
        bucket
    }

    /// Swap in a fresh bucket starting at `start`. Caller holds `rollover`.
    fn replace_bucket(&self, start: DateTime<Utc>, events: &mut Vec<LimitEvent>) -> Arc<Bucket> {
        let max = self.max();
        let fresh = Arc::new(Bucket::open(start, self.span, max, self.limit_share, self.end_padding));
        debug!(
            target: "quotaguard::limit",
            scope = %self.scope,
            span = self.span,
            max,
            seeded = fresh.seeded(),
            start = %start,
            "opened bucket"
        );

        if let Some(previous) = self.bucket.swap(Some(fresh.clone())) {
            events.push(LimitEvent::BucketRetired(previous.retirement(&self.scope, start)));
        }
        events.push(LimitEvent::BucketOpened {
            scope: self.scope.clone(),
            span: self.span,
            max,
            seeded: fresh.seeded(),
        });
        fresh
    }
}
