use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

use crate::minute::Minute;

pub mod file;
pub mod kafka;
pub mod print;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write stat: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize stat: {0}")]
    Serialization(String),
    #[error("failed to produce stat: {0}")]
    Produce(String),
    #[error("stat not delivered within {0:?}")]
    Timeout(Duration),
    #[error("sink is closed")]
    Closed,
}

/// The record emitted once per flush tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedStat {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub count: u64,
}

impl FinalizedStat {
    pub fn new(minute: Minute, count: u64) -> Self {
        Self {
            timestamp: minute.start(),
            count,
        }
    }
}

/// Durable destination for finalized per-minute counts.
#[async_trait]
pub trait StatsSink {
    async fn write_stats(&self, minute: Minute, count: u64) -> Result<(), SinkError>;

    /// Flush buffered output and release resources. Safe to call more than once.
    async fn close(&self) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn stat_serializes_with_rfc3339_timestamp() {
        let minute = Minute::containing(datetime!(2024-03-05 14:07:42 UTC));
        let stat = FinalizedStat::new(minute, 17);

        assert_json_eq!(
            serde_json::to_value(&stat).unwrap(),
            json!({"timestamp": "2024-03-05T14:07:00Z", "count": 17})
        );
    }
}
