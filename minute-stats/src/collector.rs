use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, gauge, histogram};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::minute::Minute;
use crate::notifier::Notifier;
use crate::sinks::StatsSink;
use crate::store::{BucketStore, StoreError};
use crate::time::TimeSource;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("failed to register notification target: {0}")]
    Target(#[source] StoreError),
    #[error("failed to record id: {0}")]
    Record(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationOutcome {
    /// The tick stopped before reaching the notification step.
    NotAttempted,
    NoTarget,
    Sent(StatusCode),
    Failed(String),
}

/// What a single flush tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub minute: Minute,
    /// `None` when the count could not be read and the tick was aborted.
    pub count: Option<u64>,
    pub stat_written: bool,
    pub notification: NotificationOutcome,
}

/// Records ids into the current minute bucket and, once per flush interval,
/// finalizes the previous bucket: count, write to the sink, notify.
///
/// Holds no bucket state itself, every request and tick goes to the store.
pub struct Collector {
    store: Arc<dyn BucketStore + Send + Sync>,
    sink: Arc<dyn StatsSink + Send + Sync>,
    notifier: Arc<dyn Notifier + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    flush_interval: Duration,
    closed: AtomicBool,
}

impl Collector {
    pub fn new(
        store: Arc<dyn BucketStore + Send + Sync>,
        sink: Arc<dyn StatsSink + Send + Sync>,
        notifier: Arc<dyn Notifier + Send + Sync>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            store,
            sink,
            notifier,
            timesource,
            flush_interval,
            closed: AtomicBool::new(false),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Record `id` in the current minute, registering `target` first when one is given.
    #[instrument(skip(self))]
    pub async fn process_request(
        &self,
        id: i64,
        target: Option<&str>,
    ) -> Result<Minute, CollectorError> {
        let minute = Minute::containing(self.timesource.now());

        if let Some(target) = target.filter(|t| !t.is_empty()) {
            if let Err(err) = self.store.set_target(minute, target).await {
                counter!("minute_stats_requests_total", "outcome" => "target_failed").increment(1);
                error!(%minute, "failed to register notification target: {}", err);
                return Err(CollectorError::Target(err));
            }
        }

        if let Err(err) = self.store.add_id(minute, id).await {
            counter!("minute_stats_requests_total", "outcome" => "record_failed").increment(1);
            error!(%minute, "failed to record id: {}", err);
            return Err(CollectorError::Record(err));
        }

        counter!("minute_stats_requests_total", "outcome" => "recorded").increment(1);
        Ok(minute)
    }

    /// Finalize the bucket one flush interval in the past.
    pub async fn flush_tick(&self) -> FlushReport {
        let started = Instant::now();
        let minute = Minute::preceding(self.timesource.now(), self.flush_interval);
        let mut report = FlushReport {
            minute,
            count: None,
            stat_written: false,
            notification: NotificationOutcome::NotAttempted,
        };

        let count = match self.store.count(minute).await {
            Ok(count) => count,
            Err(err) => {
                counter!("minute_stats_flush_ticks_total", "outcome" => "count_failed")
                    .increment(1);
                error!(%minute, "failed to read distinct count, skipping flush: {}", err);
                return report;
            }
        };
        report.count = Some(count);
        gauge!("minute_stats_last_flushed_count").set(count as f64);

        match self.sink.write_stats(minute, count).await {
            Ok(()) => report.stat_written = true,
            Err(err) => error!(%minute, count, "failed to write stat: {}", err),
        }

        report.notification = self.notify(minute, count).await;

        let outcome = if report.stat_written {
            "ok"
        } else {
            "write_failed"
        };
        counter!("minute_stats_flush_ticks_total", "outcome" => outcome).increment(1);
        histogram!("minute_stats_flush_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(%minute, count, "flushed minute {}", minute.clock_label());

        report
    }

    async fn notify(&self, minute: Minute, count: u64) -> NotificationOutcome {
        let target = match self.store.get_target(minute).await {
            Ok(Some(target)) => target,
            Ok(None) => return NotificationOutcome::NoTarget,
            Err(err) => {
                counter!("minute_stats_notifications_total", "outcome" => "lookup_failed")
                    .increment(1);
                error!(%minute, "failed to look up notification target: {}", err);
                return NotificationOutcome::Failed(err.to_string());
            }
        };

        match self.notifier.post(&target, count).await {
            Ok(status) => {
                counter!("minute_stats_notifications_total", "outcome" => "sent").increment(1);
                info!(%minute, %target, "notified target, status {}", status);
                NotificationOutcome::Sent(status)
            }
            Err(err) => {
                counter!("minute_stats_notifications_total", "outcome" => "failed").increment(1);
                error!(%minute, %target, "failed to notify target: {}", err);
                NotificationOutcome::Failed(err.to_string())
            }
        }
    }

    /// Run flush ticks until `shutdown` is cancelled. A tick in progress is
    /// always finished; cancellation is only observed between ticks.
    pub async fn run(self: Arc<Self>, liveness: HealthHandle, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        liveness.report_healthy();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("flush loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let report = self.flush_tick().await;
            debug!(?report, "flush tick done");
            liveness.report_healthy();
        }
    }

    /// Release the store and the sink. Does not wait for an in-flight tick.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(err) = self.sink.close().await {
            error!("failed to close stats sink: {}", err);
        }
        if let Err(err) = self.store.close().await {
            error!("failed to close bucket store: {}", err);
        }
        info!("collector closed");
    }
}
