//! Next-request scheduling. Each response tells the client when it may query
//! again: the wait is drawn from an exponential distribution whose mean grows
//! with server load and shrinks with the client's priority.
use crate::priority::PriorityClass;
use crate::token::TokenSigner;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Upper bound for any configured wait or window: ten years.
pub const MAX_CONFIG_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SchedulerConfigError {
    #[error("{0} must be between 0 and {max} seconds", max = MAX_CONFIG_SECS)]
    InvalidMean(&'static str),
    #[error("mean waits must not decrease with priority")]
    MeansOutOfOrder,
    #[error("load_scaling must be a non-negative number")]
    InvalidLoadScaling,
    #[error("validity_window_secs must be between 1 and {max}", max = MAX_CONFIG_SECS)]
    InvalidValidityWindow,
    #[error("max_interval_secs must be between 1 and {max}", max = MAX_CONFIG_SECS)]
    InvalidMaxInterval,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub high_availability_mean_secs: f64,
    pub api_key_best_effort_mean_secs: f64,
    pub global_best_effort_mean_secs: f64,
    /// Mean multiplier per unit of utilization.
    pub load_scaling: f64,
    pub validity_window_secs: u64,
    pub max_interval_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            high_availability_mean_secs: 60.0,
            api_key_best_effort_mean_secs: 300.0,
            global_best_effort_mean_secs: 600.0,
            load_scaling: 4.0,
            validity_window_secs: 600,
            max_interval_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerConfigError> {
        let means = [
            ("high_availability_mean_secs", self.high_availability_mean_secs),
            ("api_key_best_effort_mean_secs", self.api_key_best_effort_mean_secs),
            ("global_best_effort_mean_secs", self.global_best_effort_mean_secs),
        ];
        for (name, mean) in means {
            if !mean.is_finite() || mean <= 0.0 || mean > MAX_CONFIG_SECS as f64 {
                return Err(SchedulerConfigError::InvalidMean(name));
            }
        }
        if self.high_availability_mean_secs > self.api_key_best_effort_mean_secs
            || self.api_key_best_effort_mean_secs > self.global_best_effort_mean_secs
        {
            return Err(SchedulerConfigError::MeansOutOfOrder);
        }
        if !self.load_scaling.is_finite() || self.load_scaling < 0.0 {
            return Err(SchedulerConfigError::InvalidLoadScaling);
        }
        if self.validity_window_secs == 0 || self.validity_window_secs > MAX_CONFIG_SECS {
            return Err(SchedulerConfigError::InvalidValidityWindow);
        }
        if self
            .max_interval_secs
            .is_some_and(|max| max == 0 || max > MAX_CONFIG_SECS)
        {
            return Err(SchedulerConfigError::InvalidMaxInterval);
        }
        Ok(())
    }

    fn base_mean_secs(&self, class: PriorityClass) -> f64 {
        match class {
            PriorityClass::ApiKeyHighAvailability => self.high_availability_mean_secs,
            PriorityClass::ApiKeyBestEffort => self.api_key_best_effort_mean_secs,
            PriorityClass::GlobalBestEffort => self.global_best_effort_mean_secs,
        }
    }
}

/// Server load as seen by one request.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LoadSignal {
    /// In-flight queries over capacity, in `[0, 1]`.
    pub utilization: f64,
    pub capacity_exhausted: bool,
    pub client_rate_exceeded: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleReason {
    CapacityExhausted,
    ClientRateExceeded,
}

impl ThrottleReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ThrottleReason::CapacityExhausted => "capacity_exhausted",
            ThrottleReason::ClientRateExceeded => "client_rate_exceeded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NextRequest {
    pub not_before: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Schedule {
    /// Normal operation; the caller should go on and select targets.
    Admitted { next: NextRequest },
    /// Abnormal load; the caller returns only the schedule, without targets.
    Throttled {
        next: NextRequest,
        reason: ThrottleReason,
    },
}

impl Schedule {
    pub fn next_request(&self) -> &NextRequest {
        match self {
            Schedule::Admitted { next } | Schedule::Throttled { next, .. } => next,
        }
    }
}

/// Identifies who the follow-up URL is minted for.
#[derive(Clone, Copy, Debug)]
pub struct Requester<'a> {
    pub service: &'a str,
    pub api_key: Option<&'a str>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    signer: TokenSigner,
    base_url: Url,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, signer: TokenSigner, base_url: Url) -> Self {
        Scheduler {
            config,
            signer,
            base_url,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Expected wait for `class` under `utilization`.
    pub fn mean_interval(&self, class: PriorityClass, utilization: f64) -> Duration {
        saturating_duration(self.mean_secs(class, utilization))
    }

    fn mean_secs(&self, class: PriorityClass, utilization: f64) -> f64 {
        let utilization = if utilization.is_finite() {
            utilization.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.config.base_mean_secs(class) * (1.0 + self.config.load_scaling * utilization)
    }

    /// Draws a wait from the exponential distribution with the class mean,
    /// by inverse CDF over a uniform sample in `[0, 1)`.
    pub fn sample_interval<R: Rng>(
        &self,
        class: PriorityClass,
        utilization: f64,
        rng: &mut R,
    ) -> Duration {
        let uniform: f64 = rng.random();
        let mut secs = -self.mean_secs(class, utilization) * (1.0 - uniform).ln();
        if let Some(max) = self.config.max_interval_secs {
            secs = secs.min(max as f64);
        }
        saturating_duration(secs)
    }

    pub fn schedule_next<R: Rng>(
        &self,
        class: PriorityClass,
        now: DateTime<Utc>,
        load: &LoadSignal,
        requester: &Requester<'_>,
        rng: &mut R,
    ) -> Schedule {
        let reason = if load.capacity_exhausted {
            Some(ThrottleReason::CapacityExhausted)
        } else if load.client_rate_exceeded {
            Some(ThrottleReason::ClientRateExceeded)
        } else {
            None
        };

        // A throttled client is told to wait as if the server were saturated.
        let utilization = if reason.is_some() {
            1.0
        } else {
            load.utilization
        };
        let interval = self.sample_interval(class, utilization, rng);
        let not_before = saturating_add(now, interval);
        let expires = saturating_add(
            not_before,
            Duration::from_secs(self.config.validity_window_secs),
        );
        let next = NextRequest {
            not_before,
            expires,
            url: self.next_url(requester, not_before, expires),
        };

        match reason {
            Some(reason) => Schedule::Throttled { next, reason },
            None => Schedule::Admitted { next },
        }
    }

    fn next_url(
        &self,
        requester: &Requester<'_>,
        not_before: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v2", "query", requester.service]);
        }
        if let Some(api_key) = requester.api_key {
            let token = self.signer.mint(api_key, not_before, expires);
            url.query_pairs_mut()
                .append_pair("key", api_key)
                .append_pair("access_token", &token);
        }
        url.to_string()
    }
}

/// Negative and NaN seconds become zero; overflow becomes `Duration::MAX`.
fn saturating_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

fn saturating_add(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
