use std::path::{Path, PathBuf};

use async_trait::async_trait;
use metrics::counter;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, instrument};

use crate::minute::Minute;
use crate::sinks::{SinkError, StatsSink};

/// Appends one human-readable line per finalized minute to a log file.
///
/// The file is opened once in append mode and never rotated or truncated.
/// Appends are serialized so concurrent writers never interleave lines.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub async fn new(path: impl AsRef<Path>) -> Result<FileSink, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!("appending stats to {}", path.display());

        Ok(FileSink {
            path,
            file: Mutex::new(Some(file)),
        })
    }
}

pub fn stat_line(minute: Minute, count: u64) -> String {
    format!(
        "Unique requests in minute {}: {}\n",
        minute.clock_label(),
        count
    )
}

#[async_trait]
impl StatsSink for FileSink {
    #[instrument(skip(self))]
    async fn write_stats(&self, minute: Minute, count: u64) -> Result<(), SinkError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(SinkError::Closed)?;

        if let Err(err) = file.write_all(stat_line(minute, count).as_bytes()).await {
            counter!("minute_stats_sink_writes_total", "sink" => "file", "outcome" => "error")
                .increment(1);
            error!("failed to append to {}: {}", self.path.display(), err);
            return Err(err.into());
        }
        file.flush().await?;

        counter!("minute_stats_sink_writes_total", "sink" => "file", "outcome" => "ok")
            .increment(1);
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            file.sync_all().await?;
            info!("closed stats file {}", self.path.display());
        }
        Ok(())
    }
}
