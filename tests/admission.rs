mod common;

use chrono::TimeDelta;
use common::test_helpers::{t0, FakeUpstream};
use quotaguard::prelude::*;
use quotaguard::telemetry::LimitEvent;
use std::sync::Arc;
use tower::{Layer, Service, ServiceExt};

const MATCH_TARGET: &str = "/euw1/lol/match/v5/matches/EUW1_1";

struct Harness {
    clock: ManualClock,
    upstream: FakeUpstream,
    sink: MemorySink,
    proxy: AdmissionService<FakeUpstream, MemorySink>,
}

fn harness(configure: impl FnOnce(FakeUpstream) -> FakeUpstream) -> Harness {
    let clock = ManualClock::new(t0());
    let upstream = configure(FakeUpstream::new(clock.clone()));
    let sink = MemorySink::new();
    let state = AdmissionState::new(
        LimitSettings::default(),
        RouteResolver::default(),
        "https://{}.api.riotgames.com",
    )
    .with_clock(Arc::new(clock.clone()))
    .with_sink(sink.clone());
    let proxy = AdmissionLayer::new(state).layer(upstream.clone());
    Harness { clock, upstream, sink, proxy }
}

async fn send(
    proxy: &AdmissionService<FakeUpstream, MemorySink>,
    target: &str,
) -> Result<ProxyResponse, ProxyError<std::io::Error>> {
    proxy.clone().oneshot(ProxyRequest::get(target)).await
}

fn app() -> ScopeKey {
    ScopeKey::app("euw1")
}

fn method() -> ScopeKey {
    ScopeKey::method("euw1", "match/v5/matches")
}

#[tokio::test]
async fn first_request_is_forwarded_and_limits_are_learned() {
    let h = harness(|u| u);
    let mut req = ProxyRequest::get(MATCH_TARGET);
    req.headers.insert(ProxyHeader::ApiToken, "client-supplied");
    req.headers.insert(ProxyHeader::ContentType, "application/json");

    let response = h.proxy.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, r#"{"ok":true}"#);

    let forwarded = h.upstream.requests();
    assert_eq!(forwarded[0].target, "https://euw1.api.riotgames.com/lol/match/v5/matches/EUW1_1");
    assert_eq!(forwarded[0].headers.get(ProxyHeader::ApiToken), None);
    assert_eq!(forwarded[0].headers.get(ProxyHeader::ContentType), Some("application/json"));

    let registry = h.proxy.state().registry();
    let app_bucket = registry.get(&app(), 10).unwrap().snapshot().unwrap();
    assert_eq!(app_bucket.max, 20);
    assert_eq!(app_bucket.count, 1);
    assert_eq!(app_bucket.start, t0());
    assert_eq!(registry.get(&method(), 10).unwrap().snapshot().unwrap().max, 995);
}

#[tokio::test]
async fn requests_stop_at_the_ceiling() {
    let h = harness(|u| u);
    for i in 0..20 {
        let response = send(&h.proxy, MATCH_TARGET).await.unwrap();
        assert_eq!(response.status, 200, "request {i}");
    }
    let refused = send(&h.proxy, MATCH_TARGET).await.unwrap();
    assert_eq!(refused.status, 430);
    assert_eq!(h.upstream.calls(), 20);
}

#[tokio::test]
async fn blocked_app_scope_refuses_without_counting_method_scope() {
    let h = harness(|u| u);
    let registry = h.proxy.state().registry();
    let app_handler = registry.resolve(&app(), &[(10, 25)]).await.remove(0);
    app_handler.update(t0(), t0(), 20).await;
    let method_handler = registry.resolve(&method(), &[(10, 1000)]).await.remove(0);
    method_handler.update(t0(), t0(), 1).await;
    assert!(app_handler.snapshot().unwrap().blocked);

    let response = send(&h.proxy, MATCH_TARGET).await.unwrap();
    assert_eq!(response.status, 430);
    assert_eq!(method_handler.snapshot().unwrap().count, 1);
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn refusal_carries_retry_after_and_blocked_event() {
    let h = harness(|u| u);
    let app_handler = h.proxy.state().registry().resolve(&app(), &[(10, 25)]).await.remove(0);
    // Bucket [t0, t0+10s], end_max tightened to end_min.
    app_handler.update(t0(), t0(), 20).await;
    h.clock.advance(TimeDelta::milliseconds(2_500));

    let response = send(&h.proxy, "/euw1/lol/status/v4/platform-data").await.unwrap();
    assert_eq!(response.status, 430);
    assert_eq!(response.headers.get(ProxyHeader::RetryAfter), Some("8"));
    assert!(h.sink.events().iter().any(|e| matches!(
        e,
        LimitEvent::Blocked { scope, span: 10, .. } if *scope == app()
    )));
}

#[tokio::test]
async fn uncertain_window_end_refuses_until_end_max() {
    let h = harness(|u| u);
    assert_eq!(send(&h.proxy, MATCH_TARGET).await.unwrap().status, 200);
    // Date t0 means received t0+1s, so end_max is t0+11s.
    h.clock.advance(TimeDelta::milliseconds(10_200));
    let response = send(&h.proxy, MATCH_TARGET).await.unwrap();
    assert_eq!(response.status, 430);
    assert_eq!(response.headers.get(ProxyHeader::RetryAfter), Some("1"));
}

#[tokio::test]
async fn window_rolls_over_after_end_max() {
    let h = harness(|u| u);
    for _ in 0..20 {
        send(&h.proxy, MATCH_TARGET).await.unwrap();
    }
    assert_eq!(send(&h.proxy, MATCH_TARGET).await.unwrap().status, 430);

    h.clock.advance(TimeDelta::seconds(12));
    h.upstream.reset_window();
    let response = send(&h.proxy, MATCH_TARGET).await.unwrap();
    assert_eq!(response.status, 200);

    let bucket = h.proxy.state().registry().get(&app(), 10).unwrap().snapshot().unwrap();
    assert_eq!(bucket.start, t0() + TimeDelta::seconds(12));
    assert_eq!(bucket.count, 1);
    assert!(!bucket.blocked);

    let retired: Vec<_> = h
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            LimitEvent::BucketRetired(r) if r.scope == app() => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].count, 20);
    assert_eq!(retired[0].over_requests, 1);
}

#[tokio::test]
async fn upstream_429_passes_through_and_still_reconciles() {
    let h = harness(|u| u.with_status(429, Some("method")));
    let response = send(&h.proxy, MATCH_TARGET).await.unwrap();
    assert_eq!(response.status, 429);
    assert!(h.sink.events().contains(&LimitEvent::UpstreamRejected { scope: method() }));
    let bucket = h.proxy.state().registry().get(&method(), 10).unwrap().snapshot().unwrap();
    assert_eq!(bucket.count, 1);
}

#[tokio::test]
async fn upstream_429_without_method_scope_blames_app() {
    let h = harness(|u| u.with_status(429, Some("method")));
    send(&h.proxy, "/euw1/lol/status/v4/platform-data").await.unwrap();
    assert!(h.sink.events().contains(&LimitEvent::UpstreamRejected { scope: app() }));
}

#[tokio::test]
async fn transport_failure_is_502_and_keeps_the_optimistic_count() {
    let clock = ManualClock::new(t0());
    let state = AdmissionState::new(
        LimitSettings::default(),
        RouteResolver::default(),
        "https://{}.api.riotgames.com",
    )
    .with_clock(Arc::new(clock.clone()));
    let layer = AdmissionLayer::new(state);

    let mut healthy = layer.layer(FakeUpstream::new(clock.clone()));
    healthy.ready().await.unwrap().call(ProxyRequest::get(MATCH_TARGET)).await.unwrap();

    let broken = layer.layer(FakeUpstream::new(clock.clone()).failing());
    let err = broken.oneshot(ProxyRequest::get(MATCH_TARGET)).await.unwrap_err();
    assert_eq!(err.status(), 502);
    assert!(err.is_upstream());
    assert_eq!(err.into_response().status, 502);

    let bucket = layer.state().registry().get(&app(), 10).unwrap().snapshot().unwrap();
    assert_eq!(bucket.count, 2);
}

#[tokio::test]
async fn bad_targets_are_rejected_before_admission() {
    let h = harness(|u| u);
    let err = send(&h.proxy, "/atlantis/lol/match/v5/matches/1").await.unwrap_err();
    assert_eq!(err.status(), 400);
    let err = send(&h.proxy, "ftp://euw1.api.riotgames.com/lol").await.unwrap_err();
    assert!(matches!(err, ProxyError::Route(_)));
    assert!(h.upstream.requests().is_empty());
}

#[tokio::test]
async fn malformed_headers_skip_reconciliation_but_return_the_response() {
    let h = harness(|u| u.without_rate_headers());
    let response = send(&h.proxy, MATCH_TARGET).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(h.proxy.state().registry().snapshot().is_empty());
}

#[tokio::test]
async fn unrecognized_routes_are_limited_by_app_scope_only() {
    let h = harness(|u| u);
    send(&h.proxy, "/euw1/lol/status/v4/platform-data").await.unwrap();
    let snapshot = h.proxy.state().registry().snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].0, app());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_exceed_the_ceiling() {
    let h = harness(|u| u);
    send(&h.proxy, MATCH_TARGET).await.unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let proxy = h.proxy.clone();
            tokio::spawn(async move { proxy.oneshot(ProxyRequest::get(MATCH_TARGET)).await })
        })
        .collect();
    let statuses: Vec<u16> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().status)
        .collect();

    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 19);
    assert_eq!(statuses.iter().filter(|s| **s == 430).count(), 31);
    assert_eq!(h.upstream.calls(), 20);
}
