pub mod analytics;
pub mod config;
pub mod filesystem_store;
pub mod metrics_defs;
pub mod reader;
pub mod service;
pub mod store;
pub mod synchronizer;
pub mod types;

#[cfg(test)]
mod testutils;

use analytics::{AnalyticsSource, FetchError, HttpAnalyticsSource, StaticAnalyticsSource};
use config::{AnalyticsType, StoreType};
use filesystem_store::FilesystemStore;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, PersistentStore, STORE_NAMESPACE, StoreError};

pub use reader::RateTable;
pub use service::RateTableService;
pub use synchronizer::{CycleReport, SyncError, SyncState, Synchronizer};
pub use types::{EntryKey, RateEntry, RawRow, TableSnapshot};

pub fn get_store(store_type: &StoreType) -> Result<Arc<dyn PersistentStore>, StoreError> {
    let store: Arc<dyn PersistentStore> = match store_type {
        StoreType::Filesystem { base_dir } => {
            Arc::new(FilesystemStore::new(base_dir, STORE_NAMESPACE)?)
        }
        StoreType::Memory => {
            tracing::warn!("using the in-memory store, the rate table is lost on restart");
            Arc::new(MemoryStore::new(STORE_NAMESPACE))
        }
    };
    Ok(store)
}

pub fn get_source(analytics: &AnalyticsType) -> Result<Arc<dyn AnalyticsSource>, FetchError> {
    let source: Arc<dyn AnalyticsSource> = match analytics {
        AnalyticsType::Http { url, timeout_secs } => Arc::new(HttpAnalyticsSource::new(
            url,
            Duration::from_secs(*timeout_secs),
        )?),
        AnalyticsType::Static { rows } => Arc::new(StaticAnalyticsSource::new(rows.clone())),
    };
    Ok(source)
}
