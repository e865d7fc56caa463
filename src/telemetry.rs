//! Telemetry and observability for the quota engine.
//!
//! Limit handlers and the admission pipeline emit structured [`LimitEvent`]s
//! into an injected [`TelemetrySink`]. No component reaches for a global
//! logger: the sink is handed over at construction, and plain `tracing`
//! macros carry the human-readable log lines.
//!
//! # Event Types
//!
//! - **Buckets**: `BucketOpened`, `BucketRetired`
//! - **Admission**: `Blocked`
//! - **Reconciliation**: `Reconciled`, `UpstreamRejected`
//!
//! ```rust
//! use quotaguard::limit::ScopeKey;
//! use quotaguard::telemetry::LimitEvent;
//!
//! let event = LimitEvent::UpstreamRejected { scope: ScopeKey::app("euw1") };
//! assert_eq!(event.to_string(), "UpstreamRejected(euw1:app)");
//! ```

pub mod events;
pub mod sinks;

pub use events::{event_to_json, BucketRetirement, LimitEvent};
pub use sinks::{
    emit_best_effort, ComposedSinkError, LogSink, MemorySink, MulticastSink, NullSink, SinkFuture,
    TelemetrySink,
};

use tracing_subscriber::EnvFilter;

/// Failure to install the global tracing subscriber.
#[derive(Debug, thiserror::Error)]
#[error("failed to install tracing subscriber: {0}")]
pub struct TracingInitError(String);

/// Default filter directive when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Install a fmt subscriber for the process.
///
/// `RUST_LOG` wins when set; otherwise the level follows the debug flag.
pub fn init_tracing(debug: bool) -> Result<(), TracingInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| TracingInitError(e.to_string()))
}
