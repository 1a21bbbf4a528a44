use crate::scheduler::LoadSignal;
use moka::sync::Cache;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

fn default_capacity() -> usize {
    1000
}

fn default_client_window_secs() -> u64 {
    60
}

fn default_client_max_requests() -> u32 {
    120
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoadConfig {
    /// Number of concurrent queries the server is sized for.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_client_window_secs")]
    pub client_window_secs: u64,
    /// Requests a single client may make per window.
    #[serde(default = "default_client_max_requests")]
    pub client_max_requests: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            capacity: default_capacity(),
            client_window_secs: default_client_window_secs(),
            client_max_requests: default_client_max_requests(),
        }
    }
}

/// Produces the per-request load signal: in-flight queries against capacity
/// and request counts per client over a fixed window.
pub struct LoadMonitor {
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    client_max_requests: u32,
    clients: Cache<String, Arc<AtomicU32>>,
}

/// Counts one in-flight query until dropped.
pub struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

impl LoadMonitor {
    pub fn new(config: &LoadConfig) -> Self {
        LoadMonitor {
            capacity: config.capacity.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            client_max_requests: config.client_max_requests,
            clients: Cache::builder()
                .time_to_live(Duration::from_secs(config.client_window_secs))
                .build(),
        }
    }

    pub fn begin(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Records one request from `client_ip` and returns the resulting signal.
    pub fn signal(&self, client_ip: Option<&str>) -> LoadSignal {
        let in_flight = self.in_flight();
        let client_rate_exceeded = match client_ip {
            Some(ip) => {
                let counter = self
                    .clients
                    .get_with(ip.to_string(), || Arc::new(AtomicU32::new(0)));
                counter.fetch_add(1, Ordering::AcqRel) + 1 > self.client_max_requests
            }
            None => false,
        };

        LoadSignal {
            utilization: (in_flight as f64 / self.capacity as f64).min(1.0),
            capacity_exhausted: in_flight > self.capacity,
            client_rate_exceeded,
        }
    }
}
