const BASE_DELAY: u64 = 500;
const MAX_RETRIES: u32 = 3;

use crate::types::RawRow;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::time::{Duration, sleep};

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("analytics request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("analytics backend returned {0}")]
    UnexpectedStatus(StatusCode),
    #[error("analytics backend unavailable after {0} retries")]
    RetriesExceeded(u32),
    #[error("analytics result incomplete: {0}")]
    Incomplete(String),
}

/// Source of the complete per-endpoint statistics for one cycle. Every call
/// returns a full snapshot, never an increment.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<RawRow>, FetchError>;
}

#[derive(Deserialize)]
struct AnalyticsResponse {
    rows: Vec<RawRow>,
    // Present when the backend reports how many rows the query produced
    total_rows: Option<usize>,
}

pub struct HttpAnalyticsSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpAnalyticsSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpAnalyticsSource { client, url })
    }
}

#[async_trait]
impl AnalyticsSource for HttpAnalyticsSource {
    async fn fetch(&self) -> Result<Vec<RawRow>, FetchError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let mut retries = 0;

        let response = loop {
            let response = self.client.get(self.url.clone()).send().await?;
            let status = response.status();

            if status.is_success() {
                break response;
            }

            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Err(FetchError::UnexpectedStatus(status));
            }
            if retries >= MAX_RETRIES {
                return Err(FetchError::RetriesExceeded(retries));
            }

            // Backoff between retries
            let retry_millis = BASE_DELAY * 2_u64.pow(retries);
            tracing::warn!(%status, retry_millis, "analytics backend not ready, retrying");
            sleep(Duration::from_millis(retry_millis)).await;
            retries += 1;
        };

        let body = response.json::<AnalyticsResponse>().await?;

        if let Some(total) = body.total_rows
            && total != body.rows.len()
        {
            return Err(FetchError::Incomplete(format!(
                "expected {total} rows, received {}",
                body.rows.len()
            )));
        }

        tracing::info!(rows = body.rows.len(), "fetched analytics result");
        Ok(body.rows)
    }
}

/// Serves a fixed set of rows. Useful for tests and local runs.
pub struct StaticAnalyticsSource {
    rows: parking_lot::RwLock<Vec<RawRow>>,
}

impl StaticAnalyticsSource {
    pub fn new(rows: Vec<RawRow>) -> Self {
        StaticAnalyticsSource {
            rows: parking_lot::RwLock::new(rows),
        }
    }

    /// Replaces the rows returned by subsequent fetches.
    pub fn set_rows(&self, rows: Vec<RawRow>) {
        *self.rows.write() = rows;
    }
}

#[async_trait]
impl AnalyticsSource for StaticAnalyticsSource {
    async fn fetch(&self) -> Result<Vec<RawRow>, FetchError> {
        Ok(self.rows.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = r#"{
        "rows": [
            {
                "path": "ndt_ssl",
                "policy": "geo_options",
                "target_ip": "127.0.0.1",
                "probability": 1.0,
                "requests_per_day": 100
            },
            {
                "af": "ipv4",
                "latitude": "40.7",
                "longitude": "-74.0",
                "metro": "lga",
                "path": "ndt_ssl",
                "policy": "geo_options",
                "target_ip": "127.0.0.2",
                "probability": 0.5,
                "requests_per_day": 20
            }
        ],
        "total_rows": 2
    }"#;

    fn source(server: &MockServer) -> HttpAnalyticsSource {
        HttpAnalyticsSource::new(&format!("{}/rates", server.uri()), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&mock_server)
            .await;

        let rows = source(&mock_server).fetch().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].target_ip, "127.0.0.1");
        assert_eq!(rows[0].latitude, "");
        assert_eq!(rows[1].metro, "lga");
    }

    #[tokio::test]
    async fn test_fetch_retries_then_succeeds() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(200).set_body_string(BODY))
            .mount(&mock_server)
            .await;

        let rows = source(&mock_server).fetch().await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_non_retriable_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let result = source(&mock_server).fetch().await;
        assert!(matches!(
            result,
            Err(FetchError::UnexpectedStatus(StatusCode::NOT_FOUND))
        ));
    }

    #[tokio::test]
    async fn test_fetch_incomplete() {
        let mock_server = MockServer::start().await;

        let body = r#"{"rows": [], "total_rows": 3}"#;
        Mock::given(method("GET"))
            .and(path("/rates"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&mock_server)
            .await;

        let result = source(&mock_server).fetch().await;
        assert!(matches!(result, Err(FetchError::Incomplete(_))));
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            HttpAnalyticsSource::new("not a url", Duration::from_secs(1)),
            Err(FetchError::InvalidUrl(_))
        ));
    }
}
