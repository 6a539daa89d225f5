//! API handlers for the settlement server

pub mod onboarding;
pub mod payments;
pub mod payouts;
pub mod webhook;

use axum::{http::StatusCode, Json};

use crate::error::SettlementError;
use crate::models::ApiResponse;

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<T>>)>;

pub(crate) fn failure<T>(err: SettlementError) -> (StatusCode, Json<ApiResponse<T>>) {
    if matches!(err, SettlementError::Storage(_)) {
        tracing::error!(error = %err, "ledger unavailable");
    }
    (
        err.status_code(),
        Json(ApiResponse::failure(err.code(), err.to_string())),
    )
}

pub async fn root() -> &'static str {
    "Creator Settlement API Server"
}

pub async fn health_check() -> &'static str {
    "OK"
}
