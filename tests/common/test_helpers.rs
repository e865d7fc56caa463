#![allow(dead_code)]

use chrono::{DateTime, Utc};
use quotaguard::headers::{HeaderSet, ProxyHeader};
use quotaguard::upstream::{ProxyRequest, ProxyResponse};
use quotaguard::{Clock, ManualClock};
use std::future::Ready;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

pub fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// RFC 1123 rendering, as the upstream sends it.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Upstream stand-in that counts calls and echoes the count in its
/// rate-limit headers for every declared window.
#[derive(Clone)]
pub struct FakeUpstream {
    clock: ManualClock,
    app_limit: String,
    method_limit: String,
    status: u16,
    rate_limit_type: Option<&'static str>,
    fail: bool,
    rate_headers: bool,
    calls: Arc<AtomicU32>,
    window_calls: Arc<AtomicU32>,
    requests: Arc<Mutex<Vec<ProxyRequest>>>,
}

impl FakeUpstream {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            app_limit: "25:10".into(),
            method_limit: "1000:10".into(),
            status: 200,
            rate_limit_type: None,
            fail: false,
            rate_headers: true,
            calls: Arc::new(AtomicU32::new(0)),
            window_calls: Arc::new(AtomicU32::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_app_limit(mut self, limit: &str) -> Self {
        self.app_limit = limit.into();
        self
    }

    pub fn with_status(mut self, status: u16, rate_limit_type: Option<&'static str>) -> Self {
        self.status = status;
        self.rate_limit_type = rate_limit_type;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn without_rate_headers(mut self) -> Self {
        self.rate_headers = false;
        self
    }

    /// Total calls that reached the upstream.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start a new upstream window.
    pub fn reset_window(&self) {
        self.window_calls.store(0, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn counts(limit: &str, count: u32) -> String {
        limit
            .split(',')
            .map(|pair| {
                let span = pair.split_once(':').map(|(_, s)| s).unwrap_or("0");
                format!("{count}:{span}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Service<ProxyRequest> for FakeUpstream {
    type Response = ProxyResponse;
    type Error = io::Error;
    type Future = Ready<Result<ProxyResponse, io::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ProxyRequest) -> Self::Future {
        self.requests.lock().unwrap().push(req);
        if self.fail {
            return std::future::ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let count = self.window_calls.fetch_add(1, Ordering::SeqCst) + 1;

        let mut headers = HeaderSet::new();
        headers.insert(ProxyHeader::Date, http_date(self.clock.now()));
        headers.insert(ProxyHeader::ContentType, "application/json;charset=utf-8");
        if self.rate_headers {
            headers.insert(ProxyHeader::AppRateLimit, self.app_limit.clone());
            headers.insert(ProxyHeader::AppRateLimitCount, Self::counts(&self.app_limit, count));
            headers.insert(ProxyHeader::MethodRateLimit, self.method_limit.clone());
            headers.insert(ProxyHeader::MethodRateLimitCount, Self::counts(&self.method_limit, count));
        }
        if let Some(kind) = self.rate_limit_type {
            headers.insert(ProxyHeader::RateLimitType, kind);
        }
        std::future::ready(Ok(ProxyResponse::new(self.status, headers, r#"{"ok":true}"#)))
    }
}
