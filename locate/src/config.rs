use crate::load::LoadConfig;
use crate::scheduler::{SchedulerConfig, SchedulerConfigError};
use crate::selection::SelectionConfig;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("base_url must be an absolute http(s) URL: {0}")]
    InvalidBaseUrl(String),

    #[error("token_secret cannot be empty")]
    EmptyTokenSecret,

    #[error("Empty API key")]
    EmptyApiKey,

    #[error("load capacity must be greater than 0")]
    ZeroCapacity,

    #[error("client_window_secs must be greater than 0")]
    InvalidClientWindow,

    #[error("max_results must be greater than 0")]
    ZeroMaxResults,

    #[error("Service {0} has an empty URL template")]
    EmptyTemplate(String),

    #[error("Scheduler: {0}")]
    Scheduler(#[from] SchedulerConfigError),
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

fn default_cache_read_timeout_ms() -> u64 {
    50
}

/// Query service configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for the query API
    pub listener: Listener,
    /// Listener for health and readiness checks
    pub admin_listener: Listener,
    /// Public base URL the follow-up query URLs are built from
    pub base_url: Url,
    /// HMAC key for access tokens
    pub token_secret: String,
    /// Registered API keys. When empty, any non-empty key is accepted.
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default = "default_cache_read_timeout_ms")]
    pub cache_read_timeout_ms: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    /// Per service, resource name to URL template
    #[serde(default)]
    pub services: HashMap<String, BTreeMap<String, String>>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if !matches!(self.base_url.scheme(), "http" | "https") || self.base_url.cannot_be_a_base() {
            return Err(ValidationError::InvalidBaseUrl(self.base_url.to_string()));
        }
        if self.token_secret.is_empty() {
            return Err(ValidationError::EmptyTokenSecret);
        }
        if self.api_keys.iter().any(|key| key.is_empty()) {
            return Err(ValidationError::EmptyApiKey);
        }

        self.scheduler.validate()?;

        if self.load.capacity == 0 {
            return Err(ValidationError::ZeroCapacity);
        }
        if self.load.client_window_secs == 0 {
            return Err(ValidationError::InvalidClientWindow);
        }
        if self.selection.max_results == 0 {
            return Err(ValidationError::ZeroMaxResults);
        }
        for (service, templates) in &self.services {
            if templates.values().any(|template| template.is_empty()) {
                return Err(ValidationError::EmptyTemplate(service.clone()));
            }
        }
        Ok(())
    }

    pub fn cache_read_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
listener:
    host: 0.0.0.0
    port: 8080
admin_listener:
    host: 127.0.0.1
    port: 8081
base_url: https://locate.example.net
token_secret: s3cret
api_keys: [key1, key2]
scheduler:
    high_availability_mean_secs: 30
    max_interval_secs: 3600
load:
    capacity: 200
services:
    ndt_ssl:
        download: "wss://{machine}:3010/ndt_protocol"
"#;

    #[test]
    fn test_parse_config() {
        let config: Config = serde_yaml::from_str(YAML).unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.api_keys, vec!["key1", "key2"]);
        assert_eq!(config.cache_read_timeout(), Duration::from_millis(50));

        // Unset fields keep their defaults
        assert_eq!(config.scheduler.high_availability_mean_secs, 30.0);
        assert_eq!(config.scheduler.global_best_effort_mean_secs, 600.0);
        assert_eq!(config.scheduler.max_interval_secs, Some(3600));
        assert_eq!(config.load.capacity, 200);
        assert_eq!(config.load.client_max_requests, 120);
        assert_eq!(config.selection.max_results, 4);
        assert_eq!(
            config.services["ndt_ssl"]["download"],
            "wss://{machine}:3010/ndt_protocol"
        );
    }

    #[test]
    fn test_validation_errors() {
        let base: Config = serde_yaml::from_str(YAML).unwrap();

        let mut config = base.clone();
        config.admin_listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = base.clone();
        config.token_secret = String::new();
        assert_eq!(config.validate(), Err(ValidationError::EmptyTokenSecret));

        let mut config = base.clone();
        config.base_url = Url::parse("mailto:ops@example.net").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidBaseUrl(_))
        ));

        let mut config = base.clone();
        config.api_keys.push(String::new());
        assert_eq!(config.validate(), Err(ValidationError::EmptyApiKey));

        let mut config = base.clone();
        config.scheduler.validity_window_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::Scheduler(
                SchedulerConfigError::InvalidValidityWindow
            ))
        );

        let mut config = base.clone();
        config.load.capacity = 0;
        assert_eq!(config.validate(), Err(ValidationError::ZeroCapacity));

        let mut config = base;
        config.selection.max_results = 0;
        assert_eq!(config.validate(), Err(ValidationError::ZeroMaxResults));

        // base_url must parse
        let broken = YAML.replace("https://locate.example.net", "not a url");
        assert!(serde_yaml::from_str::<Config>(&broken).is_err());
    }
}
