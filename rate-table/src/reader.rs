use crate::metrics_defs::{CACHE_FALLBACK, CACHE_HIT, CACHE_MISS};
use crate::store::{FastCache, PersistentStore, StoreError};
use crate::types::{EntryError, EntryKey, MANIFEST_KEY, RateEntry, TableManifest};
use bytes::Bytes;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt record {key}: {source}")]
    Corrupt { key: String, source: EntryError },
}

/// Read-only view of the published rate table used by request handlers.
/// Reads try the fast cache first and fall back to the persistent store on
/// a miss, an error or a timeout. Readers never write.
#[derive(Clone)]
pub struct RateTable {
    store: Arc<dyn PersistentStore>,
    cache: Arc<dyn FastCache>,
    cache_timeout: Duration,
}

impl RateTable {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        cache: Arc<dyn FastCache>,
        cache_timeout: Duration,
    ) -> Self {
        RateTable {
            store,
            cache,
            cache_timeout,
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        match tokio::time::timeout(self.cache_timeout, self.cache.get(key)).await {
            Ok(Ok(Some(value))) => {
                counter!(CACHE_HIT).increment(1);
                return Ok(Some(value));
            }
            Ok(Ok(None)) => counter!(CACHE_MISS).increment(1),
            Ok(Err(err)) => {
                counter!(CACHE_FALLBACK).increment(1);
                tracing::warn!(key, error = %err, "cache read failed, using store");
            }
            Err(_) => {
                counter!(CACHE_FALLBACK).increment(1);
                tracing::warn!(key, "cache read timed out, using store");
            }
        }
        self.store.get(key).await
    }

    pub async fn manifest(&self) -> Result<Option<TableManifest>, ReadError> {
        let Some(data) = self.read(MANIFEST_KEY).await? else {
            return Ok(None);
        };
        TableManifest::from_bytes(&data)
            .map(Some)
            .map_err(|source| ReadError::Corrupt {
                key: MANIFEST_KEY.to_string(),
                source,
            })
    }

    pub async fn entry(&self, key: &EntryKey) -> Result<Option<RateEntry>, ReadError> {
        let key = key.to_string();
        let Some(data) = self.read(&key).await? else {
            return Ok(None);
        };
        RateEntry::from_bytes(&data)
            .map(Some)
            .map_err(|source| ReadError::Corrupt { key, source })
    }

    /// Published entries for `path` stored under `policy`. Keys listed in the
    /// manifest but missing or unreadable are skipped.
    pub async fn candidates(&self, path: &str, policy: &str) -> Result<Vec<RateEntry>, ReadError> {
        let Some(manifest) = self.manifest().await? else {
            tracing::debug!("no manifest published yet");
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for raw_key in &manifest.keys {
            let key = match raw_key.parse::<EntryKey>() {
                Ok(key) => key,
                Err(err) => {
                    tracing::warn!(key = %raw_key, error = %err, "unparsable key in manifest");
                    continue;
                }
            };
            if key.path != path || key.policy != policy {
                continue;
            }
            match self.entry(&key).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => tracing::debug!(%key, "manifest key without entry"),
                Err(ReadError::Corrupt { key, source }) => {
                    tracing::warn!(%key, error = %source, "skipping corrupt entry");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(entries)
    }
}
