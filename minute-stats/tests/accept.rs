use std::time::Duration;

use axum::http::StatusCode;
use futures::future::join_all;
use time::macros::datetime;

use minute_stats::collector::NotificationOutcome;
use minute_stats::minute::Minute;
use minute_stats::store::memory::StoreCall;

mod common;
use common::TestApp;

const NOW: time::OffsetDateTime = datetime!(2024-03-05 14:07:10 UTC);
const NEXT_MINUTE: time::OffsetDateTime = datetime!(2024-03-05 14:08:00.010 UTC);

fn minute() -> Minute {
    Minute::containing(NOW)
}

#[tokio::test]
async fn accepts_valid_id() {
    let app = TestApp::new(NOW);

    let (status, body) = app.get("/api/verve/accept?id=42").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "ok\n");
    assert_eq!(app.store.calls(), vec![StoreCall::AddId(minute(), 42)]);
}

#[tokio::test]
async fn missing_id_is_rejected() {
    let app = TestApp::new(NOW);

    for uri in ["/api/verve/accept", "/api/verve/accept?id=", "/api/verve/accept?endpoint=http://a/"] {
        let (status, body) = app.get(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body, "Missing required id parameter\n", "{uri}");
    }
    assert!(app.store.calls().is_empty());
}

#[tokio::test]
async fn invalid_id_does_not_touch_the_bucket() {
    let app = TestApp::new(NOW);

    for uri in [
        "/api/verve/accept?id=abc",
        "/api/verve/accept?id=1.5",
        "/api/verve/accept?id=99999999999999999999&endpoint=http://a/",
    ] {
        let (status, body) = app.get(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body, "Invalid id parameter, must be an integer\n", "{uri}");
    }
    assert!(app.store.calls().is_empty());
}

#[tokio::test]
async fn other_methods_are_not_allowed() {
    let app = TestApp::new(NOW);

    for method in ["POST", "PUT", "DELETE", "HEAD"] {
        let (status, _) = app.request(method, "/api/verve/accept?id=99").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED, "{method}");
    }
    assert!(app.store.calls().is_empty());
}

#[tokio::test]
async fn head_does_not_record_the_id() {
    let app = TestApp::new(NOW);

    let (status, _) = app.request("HEAD", "/api/verve/accept?id=99").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

    app.time.set(NEXT_MINUTE);
    let report = app.collector.flush_tick().await;

    assert_eq!(report.count, Some(0));
    assert_eq!(
        app.store.calls(),
        vec![StoreCall::Count(minute()), StoreCall::GetTarget(minute())]
    );
}

#[tokio::test(start_paused = true)]
async fn slow_store_times_the_request_out() {
    let app = TestApp::with_request_timeout(NOW, Some(Duration::from_secs(1)));
    app.store.set_latency(Duration::from_secs(5));

    let (status, body) = app.get("/api/verve/accept?id=7").await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body, "Request timeout\n");

    // The abandoned write never reached the bucket
    assert!(app.store.calls().is_empty());
    app.store.set_latency(Duration::ZERO);
    app.time.set(NEXT_MINUTE);
    assert_eq!(app.collector.flush_tick().await.count, Some(0));
}

#[tokio::test]
async fn store_outage_answers_failed() {
    let app = TestApp::new(NOW);
    app.store.set_available(false);

    let (status, body) = app.get("/api/verve/accept?id=1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "failed\n");
}

#[tokio::test]
async fn endpoint_is_registered_and_notified_at_flush() {
    let app = TestApp::new(NOW);

    let (_, body) = app
        .get("/api/verve/accept?id=42&endpoint=http%3A%2F%2Fexample.com%2Fcb")
        .await;
    assert_eq!(body, "ok\n");
    assert!(app.notifier.posts().is_empty());

    app.time.set(NEXT_MINUTE);
    let report = app.collector.flush_tick().await;

    assert_eq!(report.notification, NotificationOutcome::Sent(StatusCode::OK));
    assert_eq!(app.sink.writes(), vec![(minute(), 1)]);
    assert_eq!(
        app.notifier.posts(),
        vec![("http://example.com/cb".to_string(), 1)]
    );
}

#[tokio::test]
async fn concurrent_requests_are_deduplicated() {
    let app = TestApp::new(NOW);

    let uris: Vec<String> = (0..50)
        .map(|i| format!("/api/verve/accept?id={}", i % 10))
        .collect();
    let responses = join_all(uris.iter().map(|uri| app.get(uri))).await;
    assert!(responses.iter().all(|(_, body)| body == "ok\n"));

    app.time.set(NEXT_MINUTE);
    app.collector.flush_tick().await;

    assert_eq!(app.sink.writes(), vec![(minute(), 10)]);
    assert!(app.notifier.posts().is_empty());
}

#[tokio::test]
async fn index_and_liveness() {
    let app = TestApp::new(NOW);

    let (status, body) = app.get("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "minute-stats");

    // Nothing registered on this registry, so it reports unhealthy
    let (status, _) = app.get("/_liveness").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _) = app.get("/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
