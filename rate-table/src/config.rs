use crate::types::RawRow;
use serde::Deserialize;
use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("interval_secs must be greater than 0")]
    InvalidInterval,
    #[error("cycle_timeout_secs must be greater than 0")]
    InvalidCycleTimeout,
    #[error("analytics timeout_secs must be greater than 0")]
    InvalidFetchTimeout,
    #[error("filesystem store base_dir is empty")]
    EmptyBaseDir,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreType {
    Filesystem { base_dir: String },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum AnalyticsType {
    Http {
        url: String,
        #[serde(default = "default_fetch_timeout_secs")]
        timeout_secs: u64,
    },
    /// Rows listed inline in the config file.
    Static { rows: Vec<RawRow> },
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_cycle_timeout_secs() -> u64 {
    600
}

fn default_synchronize() -> bool {
    true
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub analytics: AnalyticsType,
    pub store: StoreType,
    /// Seconds between synchronization cycles.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// A cycle running longer than this is aborted.
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
    /// Whether this process runs the synchronizer. Exactly one process per
    /// deployment should; the others only read the store.
    #[serde(default = "default_synchronize")]
    pub synchronize: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_secs == 0 {
            return Err(ValidationError::InvalidInterval);
        }
        if self.cycle_timeout_secs == 0 {
            return Err(ValidationError::InvalidCycleTimeout);
        }
        if let AnalyticsType::Http { timeout_secs: 0, .. } = self.analytics {
            return Err(ValidationError::InvalidFetchTimeout);
        }
        if let StoreType::Filesystem { base_dir } = &self.store
            && base_dir.is_empty()
        {
            return Err(ValidationError::EmptyBaseDir);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}
