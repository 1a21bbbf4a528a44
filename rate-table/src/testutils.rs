use crate::analytics::{AnalyticsSource, FetchError};
use crate::store::{FastCache, MemoryStore, PersistentStore, STORE_NAMESPACE, StoreError};
use crate::types::RawRow;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub fn row(path: &str, policy: &str, target_ip: &str) -> RawRow {
    RawRow {
        path: path.into(),
        policy: policy.into(),
        target_ip: target_ip.into(),
        probability: 1.0,
        requests_per_day: 100,
        ..Default::default()
    }
}

/// Returns its rows until switched into failing mode.
pub struct FailingSource {
    rows: Vec<RawRow>,
    failing: AtomicBool,
}

impl FailingSource {
    pub fn new(rows: Vec<RawRow>) -> Self {
        FailingSource {
            rows,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl AnalyticsSource for FailingSource {
    async fn fetch(&self) -> Result<Vec<RawRow>, FetchError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(FetchError::RetriesExceeded(3));
        }
        Ok(self.rows.clone())
    }
}

pub struct SlowSource {
    rows: Vec<RawRow>,
    delay: Duration,
}

impl SlowSource {
    pub fn new(rows: Vec<RawRow>, delay: Duration) -> Self {
        SlowSource { rows, delay }
    }
}

#[async_trait]
impl AnalyticsSource for SlowSource {
    async fn fetch(&self) -> Result<Vec<RawRow>, FetchError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.rows.clone())
    }
}

/// Memory store whose writes and deletes fail for selected keys.
pub struct FlakyStore {
    inner: MemoryStore,
    failing: RwLock<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        FlakyStore {
            inner: MemoryStore::new(STORE_NAMESPACE),
            failing: RwLock::new(HashSet::new()),
        }
    }

    pub fn fail_key(&self, key: &str) {
        self.failing.write().insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.write().clear();
    }

    fn check(&self, key: &str) -> Result<(), StoreError> {
        if self.failing.read().contains(key) {
            return Err(StoreError::Unavailable(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check(key)?;
        self.inner.delete(key).await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.inner.keys().await
    }
}

/// Cache that is always unreachable, or that never answers in time.
pub struct BrokenCache {
    pub hang: bool,
}

#[async_trait]
impl FastCache for BrokenCache {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        if self.hang {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Err(StoreError::Unavailable("cache down".into()))
    }

    async fn set(&self, _key: &str, _value: Bytes) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("cache down".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("cache down".into()))
    }
}
