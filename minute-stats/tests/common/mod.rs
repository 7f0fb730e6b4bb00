#![allow(dead_code)]

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use health::HealthRegistry;
use http_body_util::BodyExt;
use time::OffsetDateTime;
use tower::ServiceExt;

use minute_stats::collector::Collector;
use minute_stats::minute::Minute;
use minute_stats::notifier::{Notifier, NotifyError};
use minute_stats::router::router;
use minute_stats::sinks::{SinkError, StatsSink};
use minute_stats::store::memory::MemoryBucketStore;
use minute_stats::time::TimeSource;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub struct FixedTime {
    now: Mutex<OffsetDateTime>,
}

impl FixedTime {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap() = now;
    }
}

impl TimeSource for FixedTime {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct MemorySink {
    writes: Mutex<Vec<(Minute, u64)>>,
}

impl MemorySink {
    pub fn writes(&self) -> Vec<(Minute, u64)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatsSink for MemorySink {
    async fn write_stats(&self, minute: Minute, count: u64) -> Result<(), SinkError> {
        self.writes.lock().unwrap().push((minute, count));
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotifier {
    posts: Mutex<Vec<(String, u64)>>,
}

impl MemoryNotifier {
    pub fn posts(&self) -> Vec<(String, u64)> {
        self.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn post(&self, target: &str, count: u64) -> Result<StatusCode, NotifyError> {
        self.posts.lock().unwrap().push((target.to_string(), count));
        Ok(StatusCode::OK)
    }
}

/// A collector over in-memory doubles, plus the HTTP surface in front of it.
pub struct TestApp {
    pub router: Router,
    pub collector: Arc<Collector>,
    pub store: Arc<MemoryBucketStore>,
    pub sink: Arc<MemorySink>,
    pub notifier: Arc<MemoryNotifier>,
    pub time: Arc<FixedTime>,
}

impl TestApp {
    pub fn new(now: OffsetDateTime) -> Self {
        Self::with_request_timeout(now, None)
    }

    pub fn with_request_timeout(now: OffsetDateTime, request_timeout: Option<Duration>) -> Self {
        setup_tracing();

        let store = Arc::new(MemoryBucketStore::new());
        let sink = Arc::new(MemorySink::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let time = Arc::new(FixedTime::new(now));
        let collector = Arc::new(Collector::new(
            store.clone(),
            sink.clone(),
            notifier.clone(),
            time.clone(),
            Duration::from_secs(60),
        ));
        let router = router(
            collector.clone(),
            HealthRegistry::new("liveness"),
            None,
            request_timeout,
        );

        Self {
            router,
            collector,
            store,
            sink,
            notifier,
            time,
        }
    }

    pub async fn request(&self, method: &str, uri: &str) -> (StatusCode, String) {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, String) {
        self.request("GET", uri).await
    }
}
