//! Combines classification, scheduling and target selection into the
//! response returned to a client.
use crate::load::LoadMonitor;
use crate::metrics_defs::{
    QUERIES, QUERIES_IN_FLIGHT, QUERIES_THROTTLED, QUERY_DURATION, QUERY_ERRORS,
};
use crate::priority::{PriorityClass, classify};
use crate::scheduler::{NextRequest, Requester, Schedule, Scheduler, ThrottleReason};
use crate::selection::{ClientInfo, Policy, Selector, Target, TargetBuilder};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rate_table::RateTable;
use serde::{Deserialize, Serialize};
use shared::{counter, gauge, histogram};
use std::collections::HashSet;
use std::time::Instant;

/// Problem detail object (RFC 7807).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProblemDetail {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_request: Option<NextRequest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<Target>,
}

#[derive(Clone, Debug, Default)]
pub struct QueryRequest {
    pub service: String,
    pub policy: Option<String>,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub client: ClientInfo,
    /// Request path, reported as the problem `instance`.
    pub instance: String,
}

#[derive(Clone, Debug)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub class: PriorityClass,
    pub result: QueryResult,
}

pub struct QueryAssembler {
    table: RateTable,
    scheduler: Scheduler,
    selector: Selector,
    targets: TargetBuilder,
    load: LoadMonitor,
    api_keys: HashSet<String>,
}

impl QueryAssembler {
    pub fn new(
        table: RateTable,
        scheduler: Scheduler,
        selector: Selector,
        targets: TargetBuilder,
        load: LoadMonitor,
        api_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        QueryAssembler {
            table,
            scheduler,
            selector,
            targets,
            load,
            api_keys: api_keys.into_iter().collect(),
        }
    }

    pub fn load(&self) -> &LoadMonitor {
        &self.load
    }

    /// An API key counts when it is registered, or when no keys are
    /// registered at all.
    fn accepted_api_key<'a>(&self, api_key: Option<&'a str>) -> Option<&'a str> {
        api_key.filter(|key| {
            !key.is_empty() && (self.api_keys.is_empty() || self.api_keys.contains(*key))
        })
    }

    pub fn classify(&self, request: &QueryRequest, now: DateTime<Utc>) -> PriorityClass {
        let api_key = self.accepted_api_key(request.api_key.as_deref());
        let token = request.access_token.as_deref().filter(|t| !t.is_empty());
        let token_valid = match (api_key, token) {
            (Some(key), Some(token)) => self.scheduler.signer().is_valid(token, key, now),
            _ => false,
        };
        classify(api_key.is_some(), token.is_some(), token_valid)
    }

    pub async fn assemble(&self, request: &QueryRequest, now: DateTime<Utc>) -> QueryResponse {
        let _in_flight = self.load.begin();
        gauge!(QUERIES_IN_FLIGHT).set(self.load.in_flight() as f64);
        let start = Instant::now();

        let response = self.assemble_inner(request, now).await;

        histogram!(QUERY_DURATION).record(start.elapsed().as_secs_f64());
        counter!(QUERIES, "class" => response.class.as_str()).increment(1);
        if let Some(error) = &response.result.error {
            counter!(QUERY_ERRORS, "status" => error.status.to_string()).increment(1);
        }
        response
    }

    async fn assemble_inner(&self, request: &QueryRequest, now: DateTime<Utc>) -> QueryResponse {
        let class = self.classify(request, now);
        let failure = |status: StatusCode, title: &str, detail: String, next: Option<NextRequest>| {
            QueryResponse {
                status,
                class,
                result: QueryResult {
                    error: Some(ProblemDetail {
                        problem_type: problem_type(status).to_string(),
                        title: title.to_string(),
                        status: status.as_u16(),
                        detail: Some(detail),
                        instance: Some(request.instance.clone()),
                    }),
                    next_request: next,
                    results: Vec::new(),
                },
            }
        };

        let policy = match request.policy.as_deref() {
            None | Some("") => Policy::default(),
            Some(name) => match name.parse::<Policy>() {
                Ok(policy) => policy,
                Err(detail) => {
                    return failure(StatusCode::BAD_REQUEST, "unknown policy", detail, None);
                }
            },
        };
        if policy == Policy::Metro && request.client.metro.is_none() {
            return failure(
                StatusCode::BAD_REQUEST,
                "missing metro",
                "the metro policy requires a metro parameter".to_string(),
                None,
            );
        }

        let load = self.load.signal(request.client.ip.as_deref());
        let requester = Requester {
            service: &request.service,
            api_key: self.accepted_api_key(request.api_key.as_deref()),
        };
        let next = match self
            .scheduler
            .schedule_next(class, now, &load, &requester, &mut rand::rng())
        {
            Schedule::Admitted { next } => next,
            Schedule::Throttled { next, reason } => {
                counter!(QUERIES_THROTTLED, "reason" => reason.as_str()).increment(1);
                tracing::debug!(%class, reason = reason.as_str(), "query throttled");
                let (status, title) = match reason {
                    ThrottleReason::CapacityExhausted => {
                        (StatusCode::SERVICE_UNAVAILABLE, "capacity exhausted")
                    }
                    ThrottleReason::ClientRateExceeded => {
                        (StatusCode::TOO_MANY_REQUESTS, "client rate exceeded")
                    }
                };
                return failure(
                    status,
                    title,
                    "retry after next_request.not_before".to_string(),
                    Some(next),
                );
            }
        };

        let candidates = match self
            .table
            .candidates(&request.service, policy.table_policy())
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::error!(service = %request.service, error = %err, "rate table read failed");
                return failure(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "rate table unavailable",
                    "the rate table could not be read".to_string(),
                    Some(next),
                );
            }
        };

        let selected = self
            .selector
            .select(policy, candidates, &request.client, &mut rand::rng());
        if selected.is_empty() {
            return failure(
                StatusCode::NOT_FOUND,
                "no targets",
                format!(
                    "no eligible targets for service '{}' with policy '{policy}'",
                    request.service
                ),
                Some(next),
            );
        }

        QueryResponse {
            status: StatusCode::OK,
            class,
            result: QueryResult {
                error: None,
                next_request: Some(next),
                results: selected.iter().map(|entry| self.targets.build(entry)).collect(),
            },
        }
    }
}

fn problem_type(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "bad-request",
        StatusCode::NOT_FOUND => "no-targets",
        StatusCode::TOO_MANY_REQUESTS => "client-rate-exceeded",
        StatusCode::SERVICE_UNAVAILABLE => "unavailable",
        _ => "about:blank",
    }
}
