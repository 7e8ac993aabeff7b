//! Error types for the faucet service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use drip_common::error::StoreError;
use drip_core::PoolError;
use serde_json::json;
use thiserror::Error;

/// Faucet service errors
#[derive(Error, Debug)]
pub enum FaucetError {
    #[error("No config for network: {0}")]
    UnknownNetwork(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("No big faucet safe configured for network: {0}")]
    SafeNotConfigured(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Account pool error: {0}")]
    PoolError(#[from] PoolError),

    #[error("RPC error: {0}")]
    RpcError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            FaucetError::UnknownNetwork(_) => (StatusCode::NOT_FOUND, "UNKNOWN_NETWORK"),
            FaucetError::InvalidAddress(_) => (StatusCode::BAD_REQUEST, "INVALID_ADDRESS"),
            FaucetError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
            FaucetError::InvalidKey(_) => (StatusCode::BAD_REQUEST, "INVALID_KEY"),
            FaucetError::RequestNotFound(_) => (StatusCode::NOT_FOUND, "REQUEST_NOT_FOUND"),
            FaucetError::SafeNotConfigured(_) => (StatusCode::NOT_FOUND, "SAFE_NOT_CONFIGURED"),
            FaucetError::TransactionFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TRANSACTION_FAILED"),
            FaucetError::StoreError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            FaucetError::PoolError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "POOL_ERROR"),
            FaucetError::RpcError(_) => (StatusCode::BAD_GATEWAY, "RPC_ERROR"),
            FaucetError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "error": error_code,
            "message": self.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }));

        (status, body).into_response()
    }
}

pub type FaucetResult<T> = Result<T, FaucetError>;
