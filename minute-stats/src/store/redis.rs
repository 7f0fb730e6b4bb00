use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, RedisResult};
use tokio::time::timeout;
use tracing::{info, instrument};

use crate::config::RedisConfig;
use crate::minute::Minute;
use crate::store::{BucketKeys, BucketStore, StoreError, BUCKET_TTL};

const BUCKET_TTL_SECS: usize = BUCKET_TTL.as_secs() as usize;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = RedisResult<T>>,
{
    match timeout(deadline, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

/// Bucket store backed by Redis.
///
/// Distinct ids live in a set per minute, targets in a plain string key per
/// minute. A single multiplexed connection is shared by all callers, until
/// `close` drops it.
pub struct RedisBucketStore {
    connection: RwLock<Option<MultiplexedConnection>>,
    keys: BucketKeys,
    deadline: Duration,
}

impl RedisBucketStore {
    /// Connects and pings the server, failing if it is not reachable within the deadline.
    pub async fn new(config: &RedisConfig) -> Result<RedisBucketStore, StoreError> {
        let deadline = config.redis_timeout_ms.0;
        info!("connecting to Redis at {}...", config.redis_url);

        let client = redis::Client::open(config.redis_url.as_str())?;
        let mut connection =
            with_deadline(deadline, client.get_multiplexed_async_connection()).await?;

        let pong: String =
            with_deadline(deadline, redis::cmd("PING").query_async(&mut connection)).await?;
        info!("connected to Redis ({})", pong);

        Ok(RedisBucketStore {
            connection: RwLock::new(Some(connection)),
            keys: BucketKeys::new(&config.redis_key_prefix),
            deadline,
        })
    }

    /// A handle on the shared connection. Calls already in flight keep their
    /// clone, the connection goes away once the last one finishes.
    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    #[instrument(skip(self))]
    async fn add_id(&self, minute: Minute, id: i64) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let key = self.keys.ids(minute);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .sadd(&key, id)
            .ignore()
            .expire(&key, BUCKET_TTL_SECS)
            .ignore();

        with_deadline(self.deadline, pipe.query_async(&mut conn)).await
    }

    #[instrument(skip(self))]
    async fn count(&self, minute: Minute) -> Result<u64, StoreError> {
        let mut conn = self.connection()?;
        let key = self.keys.ids(minute);

        // SCARD on a missing key is 0
        with_deadline(self.deadline, conn.scard(&key)).await
    }

    #[instrument(skip(self))]
    async fn set_target(&self, minute: Minute, url: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let key = self.keys.target(minute);

        with_deadline(self.deadline, conn.set_ex(&key, url, BUCKET_TTL_SECS)).await
    }

    #[instrument(skip(self))]
    async fn get_target(&self, minute: Minute) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection()?;
        let key = self.keys.target(minute);

        with_deadline(self.deadline, conn.get(&key)).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let released = self
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            info!("closed Redis bucket store connection");
        }
        Ok(())
    }
}
