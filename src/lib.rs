#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # quotaguard
//!
//! Admission control for a reverse proxy in front of an upstream API whose
//! quotas are only known from its response headers.
//!
//! The upstream never announces its windows ahead of time. Every response
//! carries `limit:span` and `count:span` pairs for the application and for
//! the called method; quotaguard learns the windows from them, counts
//! requests optimistically before forwarding, and corrects its counts with
//! the upstream's authoritative numbers afterwards. Requests that would
//! exceed a safety-margined ceiling are refused locally with `430` and a
//! `Retry-After`, before they can cost an upstream `429`.
//!
//! ## Components
//!
//! - [`limit::Bucket`]: accounting state of one quota window.
//! - [`limit::LimitHandler`]: the live bucket of one (scope, span), with
//!   permit acquisition, optimistic counting and reconciliation.
//! - [`limit::LimitRegistry`]: handlers per scope, created on first sight.
//! - [`admission::AdmissionLayer`]: the per-request pipeline as a tower layer.
//!
//! ## Quick Start
//!
//! ```rust
//! use quotaguard::prelude::*;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let state = AdmissionState::new(
//!     LimitSettings::default(),
//!     RouteResolver::default(),
//!     "https://{}.api.riotgames.com",
//! );
//! let upstream = service_fn(|_req: ProxyRequest| async move {
//!     let mut headers = HeaderSet::new();
//!     headers.insert(ProxyHeader::AppRateLimit, "20:1,100:120");
//!     headers.insert(ProxyHeader::AppRateLimitCount, "1:1,1:120");
//!     Ok::<_, std::io::Error>(ProxyResponse::new(200, headers, "{}"))
//! });
//!
//! let proxy = AdmissionLayer::new(state).layer(upstream);
//! let response = proxy
//!     .oneshot(ProxyRequest::get("/euw1/lol/status/v4/platform-data"))
//!     .await
//!     .unwrap();
//! assert_eq!(response.status, 200);
//! # }
//! ```

pub mod admission;
pub mod clock;
pub mod config;
pub mod error;
pub mod headers;
pub mod limit;
pub mod prelude;
pub mod route;
pub mod telemetry;
pub mod upstream;

// Re-exports
pub use admission::{AdmissionLayer, AdmissionService, AdmissionState, Stage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ProxyConfig, UpstreamSettings};
pub use error::ProxyError;
pub use headers::{HeaderError, HeaderSet, ProxyHeader};
pub use limit::{
    Admission, Bucket, BucketSnapshot, LimitError, LimitHandler, LimitRegistry, LimitSettings,
    Permit, ScopeKey, ScopeKind,
};
pub use route::{Route, RouteError, RouteResolver};
pub use upstream::{ProxyRequest, ProxyResponse, ReqwestUpstream, UpstreamError};
