use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;
use validator::Validate;

use super::{failure, ApiResult};
use crate::models::{ApiResponse, CreateEscrowRequest, CreateEscrowResponse, Earning, EscrowIntent};
use crate::services::{EarningsCalculator, PaymentIntake};

/// Open an escrow for a brand payment
pub async fn create_escrow(
    State(intake): State<Arc<PaymentIntake>>,
    Json(request): Json<CreateEscrowRequest>,
) -> ApiResult<CreateEscrowResponse> {
    if let Err(e) = request.validate() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::failure(
                "validation_error",
                format!("Validation error: {}", e),
            )),
        ));
    }

    intake
        .create_escrow(
            request.campaign_id,
            request.brand_id,
            request.amount,
            &request.currency,
        )
        .await
        .map(|response| Json(ApiResponse::ok(response)))
        .map_err(failure)
}

pub async fn get_escrow(
    State(intake): State<Arc<PaymentIntake>>,
    Path(id): Path<Uuid>,
) -> ApiResult<EscrowIntent> {
    intake
        .get_escrow(id)
        .await
        .map(|escrow| Json(ApiResponse::ok(escrow)))
        .map_err(failure)
}

pub async fn list_escrow_earnings(
    State(earnings): State<Arc<EarningsCalculator>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Earning>> {
    earnings
        .earnings_for_escrow(id)
        .await
        .map(|earnings| Json(ApiResponse::ok(earnings)))
        .map_err(failure)
}
