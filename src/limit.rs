//! Quota tracking primitives.
//!
//! The engine never knows the upstream's quota windows up front. It learns
//! them from response headers and keeps one [`Bucket`] per (scope, span)
//! pair:
//! - [`Bucket`]: the accounting state of one window instance.
//! - [`LimitHandler`]: owns the live bucket for one (scope, span) and exposes
//!   permit acquisition, optimistic accounting and reconciliation.
//! - [`LimitRegistry`]: lazily maps each scope key to its handlers, one per
//!   window span the upstream has declared.
//!
//! # Accounting model
//!
//! Pre-flight, [`LimitHandler::acquire_permit`] checks the bucket and
//! [`LimitHandler::add`] optimistically counts the request. Post-flight,
//! [`LimitHandler::update`] folds in the authoritative count echoed by the
//! upstream. Local counts only ever move up, so local accounting errs on the
//! side of refusing too early rather than too late.

use chrono::{DateTime, TimeDelta, Utc};
use std::fmt;

pub mod bucket;
pub mod handler;
pub mod registry;

pub use bucket::{Bucket, BucketSnapshot};
pub use handler::LimitHandler;
pub use registry::LimitRegistry;

/// Smallest admitted ceiling for any bucket, whatever the upstream declares.
pub const MIN_BUCKET_MAX: u32 = 5;

/// Axis along which an upstream quota applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScopeKind {
    /// Whole API key, per region.
    App,
    /// One route, per region.
    Method,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKind::App => write!(f, "app"),
            ScopeKind::Method => write!(f, "method"),
        }
    }
}

/// Identifies one quota scope: `(region, kind, identifier)`.
///
/// The identifier is the region itself for [`ScopeKind::App`] and the
/// normalized method path for [`ScopeKind::Method`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeKey {
    region: String,
    kind: ScopeKind,
    identifier: String,
}

impl ScopeKey {
    /// App-wide scope for `region`.
    pub fn app(region: impl Into<String>) -> Self {
        let region = region.into();
        Self { identifier: region.clone(), region, kind: ScopeKind::App }
    }

    /// Method scope for `method` within `region`.
    pub fn method(region: impl Into<String>, method: impl Into<String>) -> Self {
        Self { region: region.into(), kind: ScopeKind::Method, identifier: method.into() }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScopeKind::App => write!(f, "{}:app", self.region),
            ScopeKind::Method => write!(f, "{}:method:{}", self.region, self.identifier),
        }
    }
}

/// Outcome of an admission step against one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Admitted,
    /// The bucket refuses the request until `retry_at`.
    Blocked {
        /// Earliest moment the caller should try again.
        retry_at: DateTime<Utc>,
    },
}

impl Admission {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }

    /// Retry deadline when blocked.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Admission::Blocked { retry_at } => Some(*retry_at),
            Admission::Admitted => None,
        }
    }
}

/// Result of [`LimitHandler::acquire_permit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// The live bucket has room for the request.
    Current,
    /// The planned time lies past the live bucket's end; the request belongs
    /// to the next window, which [`LimitHandler::add`] opens on demand.
    NextBucket,
    /// The bucket is full, or its window may have ended without proof yet.
    Blocked {
        /// Earliest moment the caller should try again.
        retry_at: DateTime<Utc>,
    },
}

impl Permit {
    /// True unless blocked.
    pub fn is_granted(&self) -> bool {
        !matches!(self, Permit::Blocked { .. })
    }

    /// Collapse into an [`Admission`].
    pub fn admission(&self) -> Admission {
        match self {
            Permit::Blocked { retry_at } => Admission::Blocked { retry_at: *retry_at },
            Permit::Current | Permit::NextBucket => Admission::Admitted,
        }
    }
}

/// Internal precondition failures of the limit engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    /// `acquire_permit` was called before any bucket was initialized.
    #[error("no live bucket for {scope} ({span}s); a bucket must be opened before permits are acquired")]
    BucketMissing {
        /// Scope of the handler.
        scope: ScopeKey,
        /// Window span in seconds.
        span: u32,
    },
}

/// Tunables shared by every handler.
///
/// The margins are not semantically load-bearing: they trade throughput for
/// distance from the upstream's true ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitSettings {
    /// Subtracted from every upstream-declared limit.
    pub safety_margin: u32,
    /// Fraction of the quota this instance may claim, in `(0, 1]`.
    pub limit_share: f64,
    /// Uncertainty allowed past `end_min` before a window is assumed over.
    pub end_padding: TimeDelta,
}

impl LimitSettings {
    /// Effective ceiling for an upstream-declared limit.
    pub fn effective_max(&self, declared: u32) -> u32 {
        declared.saturating_sub(self.safety_margin).max(MIN_BUCKET_MAX)
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self { safety_margin: 5, limit_share: 1.0, end_padding: TimeDelta::seconds(2) }
    }
}
