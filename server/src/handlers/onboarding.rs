use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use super::{failure, ApiResult};
use crate::models::{Account, AccountLinkResponse, ApiResponse, Earning, OnboardingStatusResponse};
use crate::services::{EarningsCalculator, OnboardingManager};

/// Start (or resume) onboarding for a creator
pub async fn start_onboarding(
    State(onboarding): State<Arc<OnboardingManager>>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Account> {
    onboarding
        .start_onboarding(creator_id)
        .await
        .map(|account| Json(ApiResponse::ok(account)))
        .map_err(failure)
}

/// Fresh hosted onboarding link
pub async fn create_account_link(
    State(onboarding): State<Arc<OnboardingManager>>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<AccountLinkResponse> {
    onboarding
        .create_account_link(creator_id)
        .await
        .map(|url| Json(ApiResponse::ok(AccountLinkResponse { url })))
        .map_err(failure)
}

pub async fn get_onboarding_status(
    State(onboarding): State<Arc<OnboardingManager>>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<OnboardingStatusResponse> {
    onboarding
        .get_status(creator_id)
        .await
        .map(|status| Json(ApiResponse::ok(status)))
        .map_err(failure)
}

pub async fn deactivate_account(
    State(onboarding): State<Arc<OnboardingManager>>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Account> {
    onboarding
        .deactivate_account(creator_id)
        .await
        .map(|account| Json(ApiResponse::ok(account)))
        .map_err(failure)
}

/// Every earning credited to the creator's account
pub async fn list_creator_earnings(
    State(earnings): State<Arc<EarningsCalculator>>,
    Path(creator_id): Path<Uuid>,
) -> ApiResult<Vec<Earning>> {
    earnings
        .earnings_for_creator(creator_id)
        .await
        .map(|earnings| Json(ApiResponse::ok(earnings)))
        .map_err(failure)
}
