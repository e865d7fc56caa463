//! Request/response types and the `reqwest` forwarder.

use crate::config::UpstreamSettings;
use crate::headers::{HeaderSet, ProxyHeader};
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_service::Service;
use tracing::debug;

/// Status returned when the proxy refuses a request locally. Distinct from
/// the upstream's own 429.
pub const LOCAL_LIMIT_STATUS: u16 = 430;

/// An inbound or forwarded request.
///
/// Inbound, `target` is whatever the client sent (absolute- or origin-form).
/// Forwarded, it is the full upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub target: String,
    pub headers: HeaderSet,
}

impl ProxyRequest {
    pub fn get(target: impl Into<String>) -> Self {
        Self { target: target.into(), headers: HeaderSet::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderSet,
    pub body: String,
}

impl ProxyResponse {
    pub fn new(status: u16, headers: HeaderSet, body: impl Into<String>) -> Self {
        Self { status, headers, body: body.into() }
    }

    /// JSON error body in the upstream's `{"status": {...}}` shape.
    pub fn error(status: u16, message: &str) -> Self {
        let mut headers = HeaderSet::new();
        headers.insert(ProxyHeader::ContentType, "application/json;charset=utf-8");
        let body = serde_json::json!({
            "status": { "status_code": status, "message": message }
        });
        Self { status, headers, body: body.to_string() }
    }

    /// Local refusal carrying `Retry-After` in whole seconds.
    pub fn limited(retry_after_secs: u64) -> Self {
        let mut response = Self::error(LOCAL_LIMIT_STATUS, "Rate limit exceeded (proxy)");
        response.headers.insert(ProxyHeader::RetryAfter, retry_after_secs.to_string());
        response
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("upstream request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("upstream transport failure: {0}")]
    Transport(#[source] reqwest::Error),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err)
        } else {
            UpstreamError::Transport(err)
        }
    }
}

/// Forwards GET requests upstream with the API key injected.
#[derive(Debug, Clone)]
pub struct ReqwestUpstream {
    http: reqwest::Client,
    api_key: Arc<str>,
}

impl ReqwestUpstream {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(UpstreamError::Client)?;
        Ok(Self { http, api_key: Arc::from(settings.api_key.as_str()) })
    }
}

/// Keep only the headers the proxy knows.
pub fn filter_headers(map: &HeaderMap) -> HeaderSet {
    let mut headers = HeaderSet::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            headers.insert_raw(name.as_str(), value);
        }
    }
    headers
}

impl Service<ProxyRequest> for ReqwestUpstream {
    type Response = ProxyResponse;
    type Error = UpstreamError;
    type Future = BoxFuture<'static, Result<ProxyResponse, UpstreamError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ProxyRequest) -> Self::Future {
        let http = self.http.clone();
        let api_key = self.api_key.clone();
        Box::pin(async move {
            let mut builder = http.get(&req.target);
            for (header, value) in req.headers.iter() {
                if header != ProxyHeader::ApiToken {
                    builder = builder.header(header.as_str(), value);
                }
            }
            let response =
                builder.header(ProxyHeader::ApiToken.as_str(), api_key.as_ref()).send().await?;

            let status = response.status().as_u16();
            let headers = filter_headers(response.headers());
            let body = response.text().await?;
            debug!(target: "quotaguard::upstream", url = %req.target, status, "upstream responded");
            Ok(ProxyResponse { status, headers, body })
        })
    }
}
