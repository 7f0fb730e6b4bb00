use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use health::{ComponentStatus, HealthRegistry};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::collector::Collector;
use crate::config::{Config, SinkKind};
use crate::notifier::HttpNotifier;
use crate::prometheus::setup_metrics_recorder;
use crate::router;
use crate::sinks::file::FileSink;
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;
use crate::sinks::StatsSink;
use crate::store::redis::RedisBucketStore;
use crate::store::BUCKET_TTL;
use crate::time::SystemTime;

const EXACT_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Rejects intervals the flush loop cannot work with. A tick reads the bucket
/// one interval back, so the interval must stay under the bucket TTL.
pub fn validate_flush_interval(flush_interval: Duration) -> anyhow::Result<()> {
    if flush_interval.is_zero() {
        anyhow::bail!("FLUSH_INTERVAL_MS must be greater than zero");
    }
    if flush_interval >= BUCKET_TTL {
        anyhow::bail!(
            "FLUSH_INTERVAL_MS must be below the {:?} bucket TTL, got {:?}",
            BUCKET_TTL,
            flush_interval
        );
    }
    if flush_interval != EXACT_FLUSH_INTERVAL {
        warn!(
            "flush interval is {:?}: buckets are one minute wide, so some will be flushed twice or never",
            flush_interval
        );
    }
    Ok(())
}

/// Serve `app` until `shutdown` resolves, then give open connections up to
/// `drain_timeout` to finish before returning.
pub async fn serve_until<F>(
    listener: TcpListener,
    app: Router,
    shutdown: F,
    drain_timeout: Duration,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let draining = CancellationToken::new();
    let signal = draining.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            signal.cancel();
        })
        .into_future();

    tokio::select! {
        served = server => served,
        _ = async {
            draining.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            warn!("connections still open after {:?}, stopping anyway", drain_timeout);
            Ok(())
        }
    }
}

pub async fn create_sink(
    config: &Config,
    liveness: &HealthRegistry,
) -> anyhow::Result<Arc<dyn StatsSink + Send + Sync>> {
    match config.stats_sink {
        SinkKind::Print => {
            // Print sink is only used for local debug, don't allow a container with it to run on prod
            liveness
                .register("print_sink".to_string(), Duration::from_secs(30))
                .report_status(ComponentStatus::Unhealthy);

            Ok(Arc::new(PrintSink {}))
        }
        SinkKind::File => {
            let sink = FileSink::new(&config.log_file_path)
                .await
                .with_context(|| format!("failed to open {}", config.log_file_path))?;
            Ok(Arc::new(sink))
        }
        SinkKind::Kafka => {
            let sink_liveness =
                liveness.register("rdkafka".to_string(), Duration::from_secs(30));
            let sink = KafkaSink::new(&config.kafka, sink_liveness)
                .context("failed to start Kafka sink")?;
            Ok(Arc::new(sink))
        }
    }
}

/// Wire every component, serve until `shutdown` resolves, then stop the flush
/// loop and release the store and the sink.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let flush_interval = config.flush_interval_ms.0;
    validate_flush_interval(flush_interval)?;

    let liveness = HealthRegistry::new("liveness");

    // Don't install metrics unless asked to
    let metrics = match config.export_prometheus {
        true => Some(setup_metrics_recorder().context("failed to install metrics recorder")?),
        false => None,
    };

    let store = RedisBucketStore::new(&config.redis)
        .await
        .context("failed to connect to the bucket store")?;
    let sink = create_sink(&config, &liveness).await?;
    let notifier =
        HttpNotifier::new(config.notify_timeout_ms.0).context("failed to build notifier")?;

    let collector = Arc::new(Collector::new(
        Arc::new(store),
        sink,
        Arc::new(notifier),
        Arc::new(SystemTime {}),
        flush_interval,
    ));

    let flush_liveness = liveness.register(
        "flush_loop".to_string(),
        flush_interval * 2 + Duration::from_secs(30),
    );
    let flush_shutdown = CancellationToken::new();
    let flush_task = tokio::spawn(
        collector
            .clone()
            .run(flush_liveness, flush_shutdown.clone()),
    );

    let request_timeout = Some(config.request_timeout_ms.0).filter(|t| !t.is_zero());
    let app = router::router(collector.clone(), liveness, metrics, request_timeout);

    info!("listening on {:?}", listener.local_addr()?);
    let served = serve_until(
        listener,
        app,
        shutdown,
        config.http_shutdown_timeout_ms.0,
    )
    .await;
    info!("HTTP server stopped");

    flush_shutdown.cancel();
    match tokio::time::timeout(config.shutdown_grace_ms.0, flush_task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!("flush loop task failed: {}", err),
        Err(_) => warn!(
            "flush loop still busy after {:?}, closing anyway",
            config.shutdown_grace_ms.0
        ),
    }
    collector.close().await;

    served.context("HTTP server failed")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::routing::get;
    use tokio::sync::Notify;

    use super::*;

    #[test]
    fn flush_interval_bounds() {
        assert!(validate_flush_interval(Duration::from_secs(60)).is_ok());
        assert!(validate_flush_interval(Duration::from_secs(5)).is_ok());
        assert!(validate_flush_interval(Duration::ZERO).is_err());
        assert!(validate_flush_interval(BUCKET_TTL).is_err());
        assert!(validate_flush_interval(Duration::from_millis(u64::MAX)).is_err());
    }

    #[tokio::test]
    async fn shutdown_does_not_wait_forever_on_open_requests() {
        let app = Router::new().route(
            "/stuck",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                "done"
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(Notify::new());
        let signal = stop.clone();

        let server = tokio::spawn(serve_until(
            listener,
            app,
            async move { signal.notified().await },
            Duration::from_millis(200),
        ));

        let client = tokio::spawn(reqwest::get(format!("http://{addr}/stuck")));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop.notify_one();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("shutdown should be bounded by the drain timeout")
            .unwrap()
            .unwrap();
        client.abort();
    }
}
