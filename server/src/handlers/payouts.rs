use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use super::{failure, ApiResult};
use crate::models::ApiResponse;
use crate::services::{PayoutCycleReport, PayoutDispatcher};

/// Response DTO for a manually triggered payout cycle
#[derive(Debug, Serialize)]
pub struct PayoutRunResponse {
    /// A cycle was already running on this instance.
    pub skipped: bool,
    pub report: Option<PayoutCycleReport>,
}

pub async fn run_payout_cycle(
    State(dispatcher): State<Arc<PayoutDispatcher>>,
) -> ApiResult<PayoutRunResponse> {
    let report = dispatcher.try_run_cycle().await.map_err(failure)?;

    Ok(Json(ApiResponse::ok(PayoutRunResponse {
        skipped: report.is_none(),
        report,
    })))
}
