use chrono::TimeDelta;
use quotaguard::limit::ScopeKey;
use quotaguard::telemetry::{BucketRetirement, LimitEvent};
use quotaguard_jsonl::JsonlSink;
use tower_service::Service;

fn retirement() -> LimitEvent {
    LimitEvent::BucketRetired(BucketRetirement {
        scope: ScopeKey::app("euw1"),
        span: 10,
        count: 18,
        max: 20,
        dead_time: TimeDelta::milliseconds(800),
        space_time: TimeDelta::milliseconds(150),
        over_requests: 3,
    })
}

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("limits.jsonl");
    let mut sink = JsonlSink::new(&path);

    sink.call(retirement()).await.unwrap();
    sink.call(LimitEvent::UpstreamRejected { scope: ScopeKey::app("kr") }).await.unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    let lines: Vec<serde_json::Value> =
        contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["kind"], "bucket_retired");
    assert_eq!(lines[0]["over_requests"], 3);
    assert_eq!(lines[0]["dead_time_ms"], 800);
    assert_eq!(lines[1]["kind"], "upstream_rejected");
    assert_eq!(lines[1]["scope"], "kr:app");
}

#[tokio::test]
async fn retirements_only_skips_other_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.jsonl");
    let mut sink = JsonlSink::retirements_only(&path);

    sink.call(LimitEvent::UpstreamRejected { scope: ScopeKey::app("kr") }).await.unwrap();
    assert!(!path.exists());

    sink.call(retirement()).await.unwrap();
    let contents = std::fs::read_to_string(&path).expect("file");
    assert_eq!(contents.lines().count(), 1);
    assert!(contents.contains("\"usage\":0.9"));
}
