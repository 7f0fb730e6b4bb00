use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::minute::Minute;
use crate::store::{BucketStore, StoreError, BUCKET_TTL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    AddId(Minute, i64),
    Count(Minute),
    SetTarget(Minute, String),
    GetTarget(Minute),
    Close,
}

#[derive(Default)]
struct Buckets {
    ids: HashMap<Minute, (HashSet<i64>, Instant)>,
    targets: HashMap<Minute, (String, Instant)>,
    calls: Vec<StoreCall>,
}

impl Buckets {
    /// Drops every bucket whose TTL has run out.
    fn prune(&mut self, now: Instant) {
        self.ids.retain(|_, (_, expires_at)| *expires_at > now);
        self.targets.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// In-process bucket store, for single-instance runs and tests.
///
/// Expiry follows tokio's clock so tests can drive it with a paused runtime.
/// Expired buckets are dropped on every write.
pub struct MemoryBucketStore {
    buckets: Mutex<Buckets>,
    latency: Mutex<Duration>,
    available: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            latency: Mutex::new(Duration::ZERO),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Toggle a simulated outage: while unavailable, every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Delay every call by `latency` before it reaches the buckets.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    /// Number of buckets held in memory, expired or not.
    pub fn bucket_count(&self) -> usize {
        let buckets = self.lock();
        buckets.ids.len() + buckets.targets.len()
    }

    /// Every call received so far, failed ones included.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn wait_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Records the call, then checks that the store can serve it.
    async fn begin(&self, call: StoreCall) -> Result<MutexGuard<'_, Buckets>, StoreError> {
        self.wait_latency().await;
        let mut buckets = self.lock();
        buckets.calls.push(call);

        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if !self.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(buckets)
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn add_id(&self, minute: Minute, id: i64) -> Result<(), StoreError> {
        let mut buckets = self.begin(StoreCall::AddId(minute, id)).await?;
        let now = Instant::now();
        buckets.prune(now);

        let (ids, expires_at) = buckets
            .ids
            .entry(minute)
            .or_insert_with(|| (HashSet::new(), now));
        ids.insert(id);
        *expires_at = now + BUCKET_TTL;
        Ok(())
    }

    async fn count(&self, minute: Minute) -> Result<u64, StoreError> {
        let buckets = self.begin(StoreCall::Count(minute)).await?;

        Ok(match buckets.ids.get(&minute) {
            Some((ids, expires_at)) if *expires_at > Instant::now() => ids.len() as u64,
            _ => 0,
        })
    }

    async fn set_target(&self, minute: Minute, url: &str) -> Result<(), StoreError> {
        let mut buckets = self.begin(StoreCall::SetTarget(minute, url.to_owned())).await?;

        let now = Instant::now();
        buckets.prune(now);

        buckets
            .targets
            .insert(minute, (url.to_owned(), now + BUCKET_TTL));
        Ok(())
    }

    async fn get_target(&self, minute: Minute) -> Result<Option<String>, StoreError> {
        let buckets = self.begin(StoreCall::GetTarget(minute)).await?;

        Ok(match buckets.targets.get(&minute) {
            Some((url, expires_at)) if *expires_at > Instant::now() => Some(url.clone()),
            _ => None,
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut buckets = self.lock();
        buckets.calls.push(StoreCall::Close);
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
