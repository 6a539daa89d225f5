//! Data models for the settlement engine

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgHasArrayType, PgTypeInfo};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

/// Connected account of a creator with the payment processor
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Account {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub external_account_id: Option<String>, // Processor account ID, set once onboarding starts
    pub onboarding_status: OnboardingStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub active: bool,
    pub status_observed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Onboarding status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "onboarding_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    NotStarted,
    Pending,
    Restricted,
    Active,
}

/// Brand payment held in escrow against a campaign
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct EscrowIntent {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub brand_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub external_intent_id: String, // Processor payment intent ID
    pub status: EscrowStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Escrow intent status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "escrow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Created,
    RequiresAction,
    Succeeded,
    Failed,
    Canceled,
}

impl EscrowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// A creator's share of one escrow intent
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct Earning {
    pub id: Uuid,
    pub account_id: Uuid,
    pub creator_id: Uuid,
    pub escrow_intent_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: EarningStatus,
    pub idempotency_key: String,
    pub payout_request_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Earning status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "earning_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EarningStatus {
    Pending,
    Payable,
    InPayout,
    Paid,
    Failed,
}

/// Batch of earnings paid out to one account
#[derive(Debug, Serialize, Deserialize, sqlx::FromRow, Clone)]
pub struct PayoutRequest {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_payout_id: Option<String>, // Set once the processor accepts the payout
    pub amount: i64,
    pub currency: String,
    pub status: PayoutStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payout request status
#[derive(Debug, Serialize, Deserialize, sqlx::Type, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "payout_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Requested,
    InTransit,
    Paid,
    Failed,
}

impl PayoutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed)
    }
}

impl PgHasArrayType for EscrowStatus {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_escrow_status")
    }
}

impl PgHasArrayType for PayoutStatus {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_payout_status")
    }
}

/// Insert payload for an escrow intent
#[derive(Debug, Clone)]
pub struct NewEscrowIntent {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub brand_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub external_intent_id: String,
}

/// Insert payload for an earning
#[derive(Debug, Clone)]
pub struct NewEarning {
    pub account_id: Uuid,
    pub creator_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub idempotency_key: String,
}

/// Capability snapshot reported by the processor for a connected account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCapabilities {
    pub status: OnboardingStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub observed_at: DateTime<Utc>,
}

/// Request DTO for creating an escrow
#[derive(Debug, Deserialize, Validate)]
pub struct CreateEscrowRequest {
    pub campaign_id: Uuid,
    pub brand_id: Uuid,
    pub amount: i64,
    #[validate(length(equal = 3))]
    pub currency: String,
}

/// Response DTO for escrow creation
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEscrowResponse {
    pub escrow_intent_id: Uuid,
    pub external_intent_id: String,
    pub client_token: String,
    pub status: EscrowStatus,
}

/// Response DTO for onboarding status
#[derive(Debug, Serialize, Deserialize)]
pub struct OnboardingStatusResponse {
    pub creator_id: Uuid,
    pub status: OnboardingStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
}

/// Response DTO for an onboarding link
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountLinkResponse {
    pub url: String,
}

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn failure(code: &str, message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(EscrowStatus::Succeeded.is_terminal());
        assert!(EscrowStatus::Canceled.is_terminal());
        assert!(!EscrowStatus::RequiresAction.is_terminal());
        assert!(PayoutStatus::Failed.is_terminal());
        assert!(!PayoutStatus::InTransit.is_terminal());
    }
}
