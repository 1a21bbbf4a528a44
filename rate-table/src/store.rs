//! Key-value backends holding the materialized rate table. The persistent
//! store is the source of truth for which keys exist; the fast cache only
//! supports point operations.
use async_trait::async_trait;
use bytes::Bytes;
use moka::sync::Cache;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Namespace of rate entries in the persistent store.
pub const STORE_NAMESPACE: &str = "endpoint_stats";
/// Namespace of rate entries in the fast cache.
pub const CACHE_NAMESPACE: &str = "memcache_requests";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    /// All keys currently held in this store's namespace.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait FastCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    /// Sets a value that never expires.
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Persistent store kept in process memory. Contents are lost on restart.
pub struct MemoryStore {
    namespace: String,
    data: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new(namespace: &str) -> Self {
        MemoryStore {
            namespace: namespace.to_string(),
            data: RwLock::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.data.read().keys().cloned().collect())
    }
}

/// In-process fast cache. Entries have no TTL and no size bound: the
/// synchronizer is the only writer and removes stale keys itself.
pub struct MokaCache {
    namespace: String,
    cache: Cache<String, Bytes>,
}

impl MokaCache {
    pub fn new(namespace: &str) -> Self {
        MokaCache {
            namespace: namespace.to_string(),
            cache: Cache::builder().build(),
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }
}

#[async_trait]
impl FastCache for MokaCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.cache.get(&self.namespaced(key)))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.cache.insert(self.namespaced(key), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.invalidate(&self.namespaced(key));
        Ok(())
    }
}
