use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use health::HealthRegistry;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::api;
use crate::collector::Collector;
use crate::prometheus::track_metrics;

#[derive(Clone)]
pub struct State {
    pub collector: Arc<Collector>,
}

async fn index() -> &'static str {
    "minute-stats"
}

/// Builds the HTTP surface. `/metrics` is only mounted when a recorder handle is given,
/// installing a global recorder from tests does not work well.
pub fn router(
    collector: Arc<Collector>,
    liveness: HealthRegistry,
    metrics: Option<PrometheusHandle>,
    request_timeout: Option<Duration>,
) -> Router {
    let state = State { collector };

    let router = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/api/verve/accept", get(api::accept));
    let router = apply_request_timeout(router, request_timeout)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}

/// Answers 408 when a handler runs longer than `request_timeout`. The handler
/// future is dropped, a store call in flight is abandoned.
pub fn apply_request_timeout<S>(router: Router<S>, request_timeout: Option<Duration>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let Some(timeout) = request_timeout else {
        tracing::info!("No request timeout middleware applied");
        return router;
    };

    router.layer(axum::middleware::from_fn(
        move |req: Request, next: Next| async move {
            let path = req.uri().path().to_string();
            match tokio::time::timeout(timeout, next.run(req)).await {
                Ok(response) => response,
                Err(_) => {
                    counter!("minute_stats_requests_timed_out_total").increment(1);
                    tracing::warn!(path = %path, "request timed out after {:?}", timeout);
                    (StatusCode::REQUEST_TIMEOUT, "Request timeout\n").into_response()
                }
            }
        },
    ))
}
