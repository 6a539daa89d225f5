use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};

use super::ApiResult;
use crate::error::SettlementError;
use crate::models::ApiResponse;
use crate::services::{ReconcileOutcome, WebhookReconciler};

pub const SIGNATURE_HEADER: &str = "Processor-Signature";

/// Processor webhook endpoint.
///
/// Rejections are 400 and never retried by the processor; transient failures are 503 so the
/// delivery is retried; anything else is acknowledged.
pub async fn processor_webhook(
    State(reconciler): State<Arc<WebhookReconciler>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ReconcileOutcome> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    match reconciler.handle_webhook_event(&body, signature).await {
        Ok(outcome) => Ok(Json(ApiResponse::ok(outcome))),
        Err(err) => {
            let status = match &err {
                SettlementError::InvalidSignature | SettlementError::InvalidPayload(_) => {
                    StatusCode::BAD_REQUEST
                }
                err if err.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
                _ => {
                    tracing::error!(error = %err, "processor event could not be applied");
                    StatusCode::OK
                }
            };
            Err((status, Json(ApiResponse::failure(err.code(), err.to_string()))))
        }
    }
}
