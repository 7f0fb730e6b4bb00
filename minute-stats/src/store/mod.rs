use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::minute::Minute;

pub mod memory;
pub mod redis;

/// How long bucket state survives its last write.
pub const BUCKET_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("bucket store unavailable: {0}")]
    Unavailable(String),
    #[error("bucket store call exceeded its {0:?} deadline")]
    Timeout(Duration),
    #[error("bucket store is closed")]
    Closed,
}

/// Shared, TTL-bounded storage for minute buckets.
///
/// Implementations must be safe to call concurrently from every ingestion
/// request and the flush loop at once: the collector adds no locking of its own.
#[async_trait]
pub trait BucketStore {
    /// Add `id` to the minute's distinct-id set and refresh the set's TTL.
    async fn add_id(&self, minute: Minute, id: i64) -> Result<(), StoreError>;

    /// Number of distinct ids in the minute, 0 if the bucket is absent or expired.
    async fn count(&self, minute: Minute) -> Result<u64, StoreError>;

    /// Register (or replace) the minute's notification target and refresh its TTL.
    async fn set_target(&self, minute: Minute, url: &str) -> Result<(), StoreError>;

    /// The minute's notification target, `None` when nothing is registered.
    async fn get_target(&self, minute: Minute) -> Result<Option<String>, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// Key layout shared with every other instance writing to the same store.
#[derive(Debug, Clone)]
pub struct BucketKeys {
    prefix: String,
}

impl BucketKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
        }
    }

    pub fn ids(&self, minute: Minute) -> String {
        format!("{}:minute:{}", self.prefix, minute.epoch_seconds())
    }

    pub fn target(&self, minute: Minute) -> String {
        format!("{}:endpoint:{}", self.prefix, minute.epoch_seconds())
    }
}
