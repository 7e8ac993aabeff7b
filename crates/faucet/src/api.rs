//! HTTP API for submitting and polling faucet requests

use crate::config::FaucetConfig;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::transfer::{format_address, parse_address};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use drip_common::traits::LockStore;
use drip_common::types::{collection_path, REQUESTS};
use drip_core::{RequestRecord, RequestStatus, RequestedTokens};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<FaucetConfig>,
    pub store: Arc<dyn LockStore>,
    pub metrics: Arc<FaucetMetrics>,
}

/// Body of a new request
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub beneficiary: String,
    #[serde(default)]
    pub tokens: RequestedTokens,
}

#[derive(Debug, Serialize)]
pub struct CreatedRequest {
    pub key: String,
    pub status: RequestStatus,
}

/// Success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub data: T,
    pub timestamp: String,
}

impl<T> SuccessResponse<T> {
    fn new(data: T) -> Json<Self> {
        Json(Self {
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/:network/requests", post(create_request_handler))
        .route("/api/:network/requests/:key", get(get_request_handler))
        .with_state(state)
}

/// Stores a new `Pending` faucet request for `beneficiary` and returns its key.
pub async fn enqueue_request(
    store: &dyn LockStore,
    config: &FaucetConfig,
    network: &str,
    beneficiary: &str,
    tokens: RequestedTokens,
) -> FaucetResult<String> {
    config.get_network(network)?;
    let beneficiary = format_address(&parse_address(beneficiary)?);

    let record = RequestRecord::faucet(beneficiary.as_str()).with_tokens(tokens);
    let value = serde_json::to_value(&record).map_err(|e| FaucetError::InternalError(e.to_string()))?;
    let key = store.push(&collection_path(network, REQUESTS), value).await?;

    info!(request = %key, network, "Enqueued {:?} request for {}", tokens, beneficiary);
    Ok(key)
}

pub async fn create_request_handler(
    State(state): State<AppState>,
    Path(network): Path<String>,
    Json(request): Json<CreateRequest>,
) -> FaucetResult<impl IntoResponse> {
    let key = enqueue_request(
        state.store.as_ref(),
        &state.config,
        &network,
        &request.beneficiary,
        request.tokens,
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        SuccessResponse::new(CreatedRequest {
            key,
            status: RequestStatus::Pending,
        }),
    ))
}

pub async fn get_request_handler(
    State(state): State<AppState>,
    Path((network, key)): Path<(String, String)>,
) -> FaucetResult<Json<SuccessResponse<Value>>> {
    state.config.get_network(&network)?;
    let record = state
        .store
        .read_record(&collection_path(&network, REQUESTS), &key)
        .await?
        .ok_or(FaucetError::RequestNotFound(key))?;
    Ok(SuccessResponse::new(record))
}

pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.gather() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            FaucetError::InternalError(e.to_string()).into_response()
        }
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Root handler with info
pub async fn root_handler(State(state): State<AppState>) -> impl IntoResponse {
    let networks: Vec<&String> = state.config.networks.keys().collect();
    Json(serde_json::json!({
        "name": "Drip Faucet",
        "version": env!("CARGO_PKG_VERSION"),
        "networks": networks,
        "endpoints": {
            "POST /api/:network/requests": "Request funds",
            "GET /api/:network/requests/:key": "Request status",
            "GET /health": "Health check",
            "GET /metrics": "Prometheus metrics"
        }
    }))
}
