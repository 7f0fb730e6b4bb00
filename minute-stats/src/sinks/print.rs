use async_trait::async_trait;
use metrics::counter;
use tracing::info;

use crate::minute::Minute;
use crate::sinks::{SinkError, StatsSink};

/// Logs stats instead of persisting them. Local debugging only.
pub struct PrintSink {}

#[async_trait]
impl StatsSink for PrintSink {
    async fn write_stats(&self, minute: Minute, count: u64) -> Result<(), SinkError> {
        info!(%minute, count, "unique requests in minute {}", minute.clock_label());
        counter!("minute_stats_sink_writes_total", "sink" => "print", "outcome" => "ok")
            .increment(1);

        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
