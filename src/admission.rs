//! The admission pipeline: a tower layer in front of the upstream forwarder.
//!
//! Each request moves through [`Stage`]s:
//!
//! 1. `Resolving`: region and method scope from the request target.
//! 2. `Admitting`: every live handler of both scopes must grant a permit, and
//!    only then is the request counted against each of them.
//! 3. `Forwarding`: the inner service is called; no lock is held meanwhile.
//! 4. `Reconciling`: the echoed counts are folded into the handlers, creating
//!    handlers for newly declared spans.
//! 5. `Done`: the upstream response goes back to the client.
//!
//! A local refusal ends the request with a `430` and `Retry-After`; it is an
//! ordinary response, not an error.

use crate::clock::{Clock, SystemClock};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::headers::{HeaderSet, ProxyHeader};
use crate::limit::{Admission, LimitHandler, LimitRegistry, LimitSettings, Permit, ScopeKey, ScopeKind};
use crate::route::{Route, RouteResolver};
use crate::telemetry::{emit_best_effort, LimitEvent, NullSink, TelemetrySink};
use crate::upstream::{ProxyRequest, ProxyResponse};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, error, trace, warn};

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolving,
    Admitting,
    Forwarding,
    Reconciling,
    Done,
    Aborted,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Aborted)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "RESOLVING",
            Stage::Admitting => "ADMITTING",
            Stage::Forwarding => "FORWARDING",
            Stage::Reconciling => "RECONCILING",
            Stage::Done => "DONE",
            Stage::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

fn enter(request: &str, stage: Stage) {
    trace!(target: "quotaguard::admission", request, stage = %stage, "stage");
}

/// Whole seconds until `retry_at`, rounded up, at least 1.
pub fn retry_after_secs(now: DateTime<Utc>, retry_at: DateTime<Utc>) -> u64 {
    let millis = (retry_at - now).num_milliseconds();
    let secs = (millis + 999).div_euclid(1_000);
    secs.max(1) as u64
}

/// State shared by every clone of an [`AdmissionService`].
#[derive(Debug)]
pub struct AdmissionState<S = NullSink> {
    registry: LimitRegistry<S>,
    resolver: RouteResolver,
    api_url: String,
    first_limit: ScopeKind,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl AdmissionState<NullSink> {
    /// State with the system clock and no telemetry.
    pub fn new(settings: LimitSettings, resolver: RouteResolver, api_url: impl Into<String>) -> Self {
        Self {
            registry: LimitRegistry::new(settings),
            resolver,
            api_url: api_url.into(),
            first_limit: ScopeKind::Method,
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.limit_settings(), config.route_resolver(), config.api_url.clone())
            .with_first_limit(config.first_limit)
    }
}

impl<S: TelemetrySink> AdmissionState<S> {
    /// Report limit events to `sink`. Discards any handlers created so far.
    pub fn with_sink<T: TelemetrySink>(self, sink: T) -> AdmissionState<T> {
        AdmissionState {
            registry: LimitRegistry::with_sink(self.registry.settings().clone(), sink.clone()),
            resolver: self.resolver,
            api_url: self.api_url,
            first_limit: self.first_limit,
            clock: self.clock,
            sink,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_first_limit(mut self, first_limit: ScopeKind) -> Self {
        self.first_limit = first_limit;
        self
    }

    pub fn registry(&self) -> &LimitRegistry<S> {
        &self.registry
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    /// Scopes of `route`, the configured first scope leading.
    fn scopes(&self, route: &Route) -> Vec<ScopeKey> {
        let app = route.app_scope();
        match (route.method_scope(), self.first_limit) {
            (Some(method), ScopeKind::Method) => vec![method, app],
            (Some(method), ScopeKind::App) => vec![app, method],
            (None, _) => vec![app],
        }
    }

    async fn blocked(
        &self,
        request: &str,
        handler: &LimitHandler<S>,
        planned_at: DateTime<Utc>,
        retry_at: DateTime<Utc>,
    ) -> ProxyResponse {
        let retry_after = retry_after_secs(planned_at, retry_at);
        debug!(
            target: "quotaguard::admission",
            request,
            scope = %handler.scope(),
            span = handler.span(),
            retry_after,
            "request refused locally"
        );
        enter(request, Stage::Aborted);
        emit_best_effort(
            self.sink.clone(),
            LimitEvent::Blocked { scope: handler.scope().clone(), span: handler.span(), retry_at },
        )
        .await;
        ProxyResponse::limited(retry_after)
    }

    /// Admit every handler of `scopes` at `planned_at`, or refuse.
    ///
    /// Permits are checked on all handlers before any is counted, so a
    /// request refused by one scope does not consume another's quota.
    async fn admit(
        &self,
        request: &str,
        scopes: &[ScopeKey],
        planned_at: DateTime<Utc>,
    ) -> Result<Option<ProxyResponse>, crate::limit::LimitError> {
        let handlers: Vec<_> = scopes.iter().flat_map(|key| self.registry.handlers(key)).collect();

        for handler in &handlers {
            if let Permit::Blocked { retry_at } = handler.acquire_permit(planned_at)? {
                return Ok(Some(self.blocked(request, handler, planned_at, retry_at).await));
            }
        }
        for handler in &handlers {
            if let Admission::Blocked { retry_at } = handler.add(planned_at).await {
                return Ok(Some(self.blocked(request, handler, planned_at, retry_at).await));
            }
        }
        Ok(None)
    }

    /// Fold the counts echoed in `headers` into the handlers of `scopes`.
    ///
    /// Missing or malformed headers skip reconciliation for that scope only.
    async fn reconcile(
        &self,
        request: &str,
        scopes: &[ScopeKey],
        headers: &HeaderSet,
        sent_at: DateTime<Utc>,
        returned_at: DateTime<Utc>,
    ) {
        let received_at = match headers.received_at() {
            Ok(at) => at,
            Err(err) => {
                warn!(target: "quotaguard::admission", request, error = %err, "no usable Date header; using local clock");
                returned_at
            }
        };

        for key in scopes {
            let report = match headers.scope_report(key.kind()) {
                Ok(report) => report,
                Err(err) => {
                    warn!(
                        target: "quotaguard::admission",
                        request,
                        scope = %key,
                        error = %err,
                        "malformed rate limit headers; skipping reconciliation"
                    );
                    continue;
                }
            };
            let handlers = self.registry.resolve(key, &report.declared()).await;
            for (handler, span) in handlers.iter().zip(report.spans()) {
                handler.update(sent_at, received_at, span.count).await;
            }
        }
    }

    async fn upstream_rejected(&self, request: &str, route: &Route, headers: &HeaderSet) {
        let method_enforced = headers
            .get(ProxyHeader::RateLimitType)
            .is_some_and(|kind| kind.eq_ignore_ascii_case("method"));
        let scope = match route.method_scope() {
            Some(method) if method_enforced => method,
            _ => route.app_scope(),
        };
        error!(
            target: "quotaguard::admission",
            request,
            scope = %scope,
            limit_type = headers.get(ProxyHeader::RateLimitType).unwrap_or("unknown"),
            "upstream returned 429"
        );
        emit_best_effort(self.sink.clone(), LimitEvent::UpstreamRejected { scope }).await;
    }

    /// Run one request through the pipeline.
    pub async fn process<T>(
        &self,
        req: ProxyRequest,
        inner: &mut T,
    ) -> Result<ProxyResponse, ProxyError<T::Error>>
    where
        T: Service<ProxyRequest, Response = ProxyResponse>,
        T::Error: fmt::Display,
    {
        let request = req.target.as_str();
        enter(request, Stage::Resolving);
        let route = self.resolver.resolve(request).map_err(|err| {
            debug!(target: "quotaguard::admission", request, error = %err, "rejected request target");
            enter(request, Stage::Aborted);
            err
        })?;
        let scopes = self.scopes(&route);

        enter(request, Stage::Admitting);
        let planned_at = self.clock.now();
        if let Some(refusal) = self.admit(request, &scopes, planned_at).await? {
            return Ok(refusal);
        }

        enter(request, Stage::Forwarding);
        let mut headers = req.headers.clone();
        headers.remove(ProxyHeader::ApiToken);
        let forwarded = ProxyRequest { target: route.upstream_url(&self.api_url), headers };
        let sent_at = self.clock.now();
        let result = inner.call(forwarded).await;
        let returned_at = self.clock.now();
        let mut response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(target: "quotaguard::admission", request, error = %err, "upstream call failed");
                enter(request, Stage::Aborted);
                return Err(ProxyError::Upstream(err));
            }
        };

        enter(request, Stage::Reconciling);
        if response.status == 429 {
            self.upstream_rejected(request, &route, &response.headers).await;
        }
        self.reconcile(request, &scopes, &response.headers, sent_at, returned_at).await;

        enter(request, Stage::Done);
        response.headers.remove(ProxyHeader::ApiToken);
        Ok(response)
    }
}

/// Layer that puts the admission pipeline in front of a forwarder.
#[derive(Debug)]
pub struct AdmissionLayer<S = NullSink> {
    state: Arc<AdmissionState<S>>,
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self { state: self.state.clone() }
    }
}

impl<S: TelemetrySink> AdmissionLayer<S> {
    pub fn new(state: AdmissionState<S>) -> Self {
        Self { state: Arc::new(state) }
    }

    pub fn state(&self) -> &Arc<AdmissionState<S>> {
        &self.state
    }
}

impl<T, S: TelemetrySink> Layer<T> for AdmissionLayer<S> {
    type Service = AdmissionService<T, S>;

    fn layer(&self, inner: T) -> Self::Service {
        AdmissionService { inner, state: self.state.clone() }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Debug)]
pub struct AdmissionService<T, S = NullSink> {
    inner: T,
    state: Arc<AdmissionState<S>>,
}

impl<T: Clone, S> Clone for AdmissionService<T, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), state: self.state.clone() }
    }
}

impl<T, S> AdmissionService<T, S> {
    pub fn state(&self) -> &Arc<AdmissionState<S>> {
        &self.state
    }
}

impl<T, S> Service<ProxyRequest> for AdmissionService<T, S>
where
    T: Service<ProxyRequest, Response = ProxyResponse> + Clone + Send + 'static,
    T::Future: Send + 'static,
    T::Error: fmt::Display + Send + 'static,
    S: TelemetrySink,
{
    type Response = ProxyResponse;
    type Error = ProxyError<T::Error>;
    type Future = BoxFuture<'static, Result<ProxyResponse, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ProxyError::Upstream)
    }

    fn call(&mut self, req: ProxyRequest) -> Self::Future {
        let state = self.state.clone();
        // The ready instance goes to this call; the clone waits for the next poll_ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move { state.process(req, &mut inner).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn retry_after_rounds_up_with_floor_of_one() {
        assert_eq!(retry_after_secs(t0(), t0() + TimeDelta::milliseconds(1_200)), 2);
        assert_eq!(retry_after_secs(t0(), t0() + TimeDelta::seconds(3)), 3);
        assert_eq!(retry_after_secs(t0(), t0()), 1);
        assert_eq!(retry_after_secs(t0(), t0() - TimeDelta::seconds(5)), 1);
    }

    #[test]
    fn scope_order_follows_first_limit() {
        let route = RouteResolver::default().resolve("/euw1/lol/match/v5/matches/EUW1_1").unwrap();
        let state = AdmissionState::new(LimitSettings::default(), RouteResolver::default(), "");
        assert_eq!(state.scopes(&route)[0].kind(), ScopeKind::Method);
        let state = state.with_first_limit(ScopeKind::App);
        assert_eq!(state.scopes(&route)[0].kind(), ScopeKind::App);

        let unrecognized = RouteResolver::default().resolve("/euw1/lol/status/v4/platform-data").unwrap();
        assert_eq!(state.scopes(&unrecognized), vec![ScopeKey::app("euw1")]);
    }

    #[test]
    fn stage_names() {
        assert_eq!(Stage::Reconciling.to_string(), "RECONCILING");
        assert!(Stage::Aborted.is_terminal());
        assert!(!Stage::Forwarding.is_terminal());
    }
}
