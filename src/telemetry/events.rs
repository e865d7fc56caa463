use crate::limit::ScopeKey;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use std::fmt;

/// Events emitted by the limit engine and the admission pipeline.
///
/// These are the observability records used to tune the safety margins:
/// how full buckets ran, how long windows stayed uncertain, and how often
/// the upstream's view disagreed with the local one.
#[derive(Debug, Clone, PartialEq)]
pub enum LimitEvent {
    /// A fresh bucket was opened for a (scope, span).
    BucketOpened {
        scope: ScopeKey,
        span: u32,
        max: u32,
        /// Count the bucket started with under a limit share.
        seeded: u32,
    },
    /// A bucket was replaced by its successor.
    BucketRetired(BucketRetirement),
    /// A request was refused locally.
    Blocked { scope: ScopeKey, span: u32, retry_at: DateTime<Utc> },
    /// The upstream reported a higher count than was tracked locally.
    Reconciled { scope: ScopeKey, span: u32, local: u32, authoritative: u32 },
    /// The upstream itself answered 429.
    UpstreamRejected { scope: ScopeKey },
}

/// Diagnostics for one retired bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRetirement {
    pub scope: ScopeKey,
    pub span: u32,
    /// Final local count.
    pub count: u32,
    pub max: u32,
    /// Gap between the declared minimum and the final maximum end.
    pub dead_time: TimeDelta,
    /// Idle time between the final maximum end and the next bucket's start.
    /// Negative when the successor was opened early on an upstream reset.
    pub space_time: TimeDelta,
    pub over_requests: u32,
}

impl BucketRetirement {
    /// Fraction of the ceiling that was used.
    pub fn usage(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        f64::from(self.count) / f64::from(self.max)
    }
}

impl fmt::Display for LimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitEvent::BucketOpened { scope, span, max, seeded } => {
                write!(f, "BucketOpened({scope}, {span}s, max={max}, seeded={seeded})")
            }
            LimitEvent::BucketRetired(record) => write!(f, "BucketRetired({record})"),
            LimitEvent::Blocked { scope, span, retry_at } => {
                write!(f, "Blocked({scope}, {span}s, retry_at={})", retry_at.to_rfc3339())
            }
            LimitEvent::Reconciled { scope, span, local, authoritative } => {
                write!(f, "Reconciled({scope}, {span}s, {local}->{authoritative})")
            }
            LimitEvent::UpstreamRejected { scope } => write!(f, "UpstreamRejected({scope})"),
        }
    }
}

impl fmt::Display for BucketRetirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}s, {}/{}, dead={}ms, space={}ms, over={}",
            self.scope,
            self.span,
            self.count,
            self.max,
            self.dead_time.num_milliseconds(),
            self.space_time.num_milliseconds(),
            self.over_requests
        )
    }
}

/// Convert a LimitEvent into a JSON value for sinks.
pub fn event_to_json(event: &LimitEvent) -> serde_json::Value {
    match event {
        LimitEvent::BucketOpened { scope, span, max, seeded } => json!({
            "kind": "bucket_opened",
            "scope": scope.to_string(),
            "span": *span,
            "max": *max,
            "seeded": *seeded,
        }),
        LimitEvent::BucketRetired(record) => json!({
            "kind": "bucket_retired",
            "scope": record.scope.to_string(),
            "span": record.span,
            "count": record.count,
            "max": record.max,
            "usage": record.usage(),
            "dead_time_ms": record.dead_time.num_milliseconds(),
            "space_time_ms": record.space_time.num_milliseconds(),
            "over_requests": record.over_requests,
        }),
        LimitEvent::Blocked { scope, span, retry_at } => json!({
            "kind": "blocked",
            "scope": scope.to_string(),
            "span": *span,
            "retry_at": retry_at.to_rfc3339(),
        }),
        LimitEvent::Reconciled { scope, span, local, authoritative } => json!({
            "kind": "reconciled",
            "scope": scope.to_string(),
            "span": *span,
            "local": *local,
            "authoritative": *authoritative,
        }),
        LimitEvent::UpstreamRejected { scope } => json!({
            "kind": "upstream_rejected",
            "scope": scope.to_string(),
        }),
    }
}
