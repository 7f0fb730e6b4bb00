use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("invalid notification target {0}")]
    InvalidTarget(String),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
    #[error("notification failed: {0}")]
    Transport(#[source] reqwest::Error),
}

/// Delivers a finalized count to a caller-registered callback.
#[async_trait]
pub trait Notifier {
    /// Send `count` to `target` once. Any HTTP status is a completed call.
    async fn post(&self, target: &str, count: u64) -> Result<StatusCode, NotifyError>;
}

/// POSTs `?count=<n>` with an empty `text/plain` body. Never retries.
pub struct HttpNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("minute-stats notifier")
            .timeout(timeout)
            .build()
            .map_err(NotifyError::Transport)?;

        Ok(Self { client, timeout })
    }
}

/// Appends the count to the target's existing query string.
pub fn notification_url(target: &str, count: u64) -> Result<Url, NotifyError> {
    let mut url =
        Url::parse(target).map_err(|e| NotifyError::InvalidTarget(format!("{target}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(NotifyError::InvalidTarget(format!(
            "{target}: unsupported scheme"
        )));
    }

    url.query_pairs_mut()
        .append_pair("count", &count.to_string());
    Ok(url)
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[instrument(skip(self))]
    async fn post(&self, target: &str, count: u64) -> Result<StatusCode, NotifyError> {
        let url = notification_url(target, count)?;

        let response = self.client.post(url).send().await.map_err(|e| {
            if e.is_timeout() {
                NotifyError::Timeout(self.timeout)
            } else {
                NotifyError::Transport(e)
            }
        })?;

        debug!("notification answered with {}", response.status());
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    #[test]
    fn appends_count_to_existing_query() {
        assert_eq!(
            notification_url("http://example.com/cb", 3).unwrap().as_str(),
            "http://example.com/cb?count=3"
        );
        assert_eq!(
            notification_url("http://example.com/cb?campaign=x", 0)
                .unwrap()
                .as_str(),
            "http://example.com/cb?campaign=x&count=0"
        );
    }

    #[test]
    fn rejects_unusable_targets() {
        assert!(matches!(
            notification_url("not a url", 1),
            Err(NotifyError::InvalidTarget(_))
        ));
        assert!(matches!(
            notification_url("ftp://example.com/cb", 1),
            Err(NotifyError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn posts_count_as_query_parameter() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/cb")
                    .query_param("count", "7")
                    .header("content-type", "text/plain");
                then.status(200);
            })
            .await;

        let notifier = HttpNotifier::new(Duration::from_secs(5)).unwrap();
        let status = notifier.post(&server.url("/cb"), 7).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_success_status_is_a_completed_call() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/cb");
                then.status(503);
            })
            .await;

        let notifier = HttpNotifier::new(Duration::from_secs(5)).unwrap();
        let status = notifier.post(&server.url("/cb"), 1).await.unwrap();

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn slow_target_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/cb");
                then.status(200).delay(Duration::from_millis(500));
            })
            .await;

        let notifier = HttpNotifier::new(Duration::from_millis(50)).unwrap();
        match notifier.post(&server.url("/cb"), 1).await {
            Err(NotifyError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(50)),
            other => panic!("expected a timeout, got {other:?}"),
        }
    }
}
