use crate::assembler::{ProblemDetail, QueryAssembler, QueryRequest, QueryResponse, QueryResult};
use crate::config::Listener as ListenerConfig;
use crate::selection::ClientInfo;
use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use rate_table::types::AddressFamily;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum LocateApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub fn router(assembler: Arc<QueryAssembler>) -> Router {
    Router::new()
        .route("/v2/query/{service}", get(query_handler))
        .with_state(assembler)
}

pub async fn serve(
    listener: ListenerConfig,
    assembler: Arc<QueryAssembler>,
) -> Result<(), LocateApiError> {
    let app = router(assembler);
    let addr = format!("{}:{}", listener.host, listener.port);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "query API listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

impl IntoResponse for QueryResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.result)).into_response()
    }
}

// Parameters are taken as strings so that bad values become problem details
// rather than extractor rejections.
#[derive(Deserialize, Debug, Default)]
struct Params {
    policy: Option<String>,
    key: Option<String>,
    access_token: Option<String>,
    lat: Option<String>,
    lon: Option<String>,
    metro: Option<String>,
    af: Option<String>,
    ip: Option<String>,
}

fn parse_location(lat: Option<&str>, lon: Option<&str>) -> Result<Option<(f64, f64)>, String> {
    let (Some(lat), Some(lon)) = (lat, lon) else {
        return Ok(None);
    };
    let lat: f64 = lat
        .parse()
        .map_err(|_| format!("invalid latitude '{lat}'"))?;
    let lon: f64 = lon
        .parse()
        .map_err(|_| format!("invalid longitude '{lon}'"))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("coordinates ({lat}, {lon}) out of range"));
    }
    Ok(Some((lat, lon)))
}

/// Client address: explicit `ip` parameter, then the first `X-Forwarded-For`
/// hop, then the peer address.
fn client_ip(
    explicit: Option<String>,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> Option<String> {
    explicit
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(|ip| ip.trim().to_string())
                .filter(|ip| !ip.is_empty())
        })
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

async fn query_handler(
    State(assembler): State<Arc<QueryAssembler>>,
    Path(service): Path<String>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    request: Request,
) -> Response {
    let instance = request.uri().path().to_string();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let bad_request = |detail: String| {
        let problem = ProblemDetail {
            problem_type: "bad-request".to_string(),
            title: "invalid parameter".to_string(),
            status: StatusCode::BAD_REQUEST.as_u16(),
            detail: Some(detail),
            instance: Some(instance.clone()),
        };
        let result = QueryResult {
            error: Some(problem),
            ..Default::default()
        };
        (StatusCode::BAD_REQUEST, Json(result)).into_response()
    };

    let location = match parse_location(params.lat.as_deref(), params.lon.as_deref()) {
        Ok(location) => location,
        Err(detail) => return bad_request(detail),
    };
    let af = match params.af.as_deref().filter(|af| !af.is_empty()) {
        None => None,
        Some(af) => match af.parse::<AddressFamily>() {
            Ok(af) => Some(af),
            Err(detail) => return bad_request(detail),
        },
    };

    let query = QueryRequest {
        service,
        policy: params.policy,
        api_key: params.key,
        access_token: params.access_token,
        client: ClientInfo {
            ip: client_ip(params.ip, &headers, peer),
            location,
            metro: params.metro.filter(|metro| !metro.is_empty()),
            af,
        },
        instance: instance.clone(),
    };

    let response = assembler.assemble(&query, Utc::now()).await;
    tracing::debug!(
        service = %query.service,
        class = %response.class,
        status = response.status.as_u16(),
        "query answered"
    );
    response.into_response()
}
