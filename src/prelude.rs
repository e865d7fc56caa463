//! Convenient re-exports for common quotaguard types.
pub use crate::{
    admission::{AdmissionLayer, AdmissionService, AdmissionState},
    clock::{Clock, ManualClock, SystemClock},
    config::ProxyConfig,
    headers::{HeaderSet, ProxyHeader},
    limit::{Admission, LimitRegistry, LimitSettings, Permit, ScopeKey, ScopeKind},
    route::RouteResolver,
    telemetry::{LimitEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    upstream::{ProxyRequest, ProxyResponse, ReqwestUpstream},
    ProxyError,
};
