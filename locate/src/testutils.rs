use crate::assembler::QueryAssembler;
use crate::load::{LoadConfig, LoadMonitor};
use crate::scheduler::{SchedulerConfig, Scheduler};
use crate::selection::{SelectionConfig, Selector, TargetBuilder};
use crate::token::TokenSigner;
use async_trait::async_trait;
use bytes::Bytes;
use rate_table::analytics::StaticAnalyticsSource;
use rate_table::store::{
    CACHE_NAMESPACE, MemoryStore, MokaCache, PersistentStore, STORE_NAMESPACE, StoreError,
};
use rate_table::{RateTable, RawRow, Synchronizer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A rate table after one successful synchronization of `rows`.
pub async fn published_table(rows: Vec<RawRow>) -> RateTable {
    let store = Arc::new(MemoryStore::new(STORE_NAMESPACE));
    let cache = Arc::new(MokaCache::new(CACHE_NAMESPACE));
    let synchronizer = Synchronizer::new(
        Arc::new(StaticAnalyticsSource::new(rows)),
        store.clone(),
        cache.clone(),
        Duration::from_secs(5),
    );
    synchronizer.run_cycle().await.unwrap();
    RateTable::new(store, cache, Duration::from_millis(50))
}

struct UnavailableStore;

#[async_trait]
impl PersistentStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<Bytes>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    async fn put(&self, _key: &str, _value: Bytes) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("store is down".into()))
    }
}

/// A rate table whose cache is empty and whose store fails every read.
pub fn failing_table() -> RateTable {
    RateTable::new(
        Arc::new(UnavailableStore),
        Arc::new(MokaCache::new(CACHE_NAMESPACE)),
        Duration::from_millis(50),
    )
}

pub fn scheduler() -> Scheduler {
    Scheduler::new(
        SchedulerConfig::default(),
        TokenSigner::new(b"test-secret").unwrap(),
        Url::parse("https://locate.example.net").unwrap(),
    )
}

pub fn assembler_with(table: RateTable, load: LoadConfig) -> QueryAssembler {
    QueryAssembler::new(
        table,
        scheduler(),
        Selector::new(&SelectionConfig::default()),
        TargetBuilder::new(HashMap::new()),
        LoadMonitor::new(&load),
        ["key1".to_string(), "key2".to_string()],
    )
}

pub fn assembler(table: RateTable) -> QueryAssembler {
    assembler_with(table, LoadConfig::default())
}
