//! Error taxonomy for the settlement engine

use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub type SettlementResult<T> = Result<T, SettlementError>;

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("amount must be greater than zero")]
    InvalidAmount,

    #[error("creator has no connected account")]
    AccountNotFound,

    #[error("connected account is already active")]
    AccountAlreadyActive,

    #[error("webhook signature verification failed")]
    InvalidSignature,

    #[error("webhook payload could not be parsed: {0}")]
    InvalidPayload(String),

    #[error("payment processor unavailable: {0}")]
    ProcessorUnavailable(String),

    #[error("payment processor rejected the request: {0}")]
    ProcessorRejected(String),

    #[error("ledger entry changed concurrently: {0}")]
    ConflictingState(String),

    #[error(
        "computed earnings {computed} exceed distributable amount {distributable} for escrow intent {escrow_intent_id}"
    )]
    InsufficientLedgerFunds {
        escrow_intent_id: Uuid,
        computed: i64,
        distributable: i64,
    },

    #[error("escrow intent not found")]
    EscrowNotFound,

    #[error("escrow intent has not succeeded")]
    EscrowNotSettled,

    #[error("ledger storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl SettlementError {
    /// Stable machine-readable code returned to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidAmount => "invalid_amount",
            Self::AccountNotFound => "account_not_found",
            Self::AccountAlreadyActive => "account_already_active",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::ProcessorUnavailable(_) => "processor_unavailable",
            Self::ProcessorRejected(_) => "processor_rejected",
            Self::ConflictingState(_) => "conflicting_state",
            Self::InsufficientLedgerFunds { .. } => "insufficient_ledger_funds",
            Self::EscrowNotFound => "escrow_not_found",
            Self::EscrowNotSettled => "escrow_not_settled",
            Self::Storage(_) => "storage_error",
            Self::Configuration(_) => "configuration_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidAmount | Self::InvalidSignature | Self::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::AccountNotFound | Self::EscrowNotFound => StatusCode::NOT_FOUND,
            Self::AccountAlreadyActive | Self::EscrowNotSettled | Self::ConflictingState(_) => {
                StatusCode::CONFLICT
            }
            Self::ProcessorUnavailable(_) | Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProcessorRejected(_) => StatusCode::BAD_GATEWAY,
            Self::InsufficientLedgerFunds { .. } | Self::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether retrying the same operation later can succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProcessorUnavailable(_) | Self::ConflictingState(_) | Self::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_map_to_service_unavailable() {
        let err = SettlementError::ProcessorUnavailable("timeout".to_string());
        assert!(err.is_transient());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "processor_unavailable");
    }

    #[test]
    fn ledger_funds_error_is_fatal() {
        let err = SettlementError::InsufficientLedgerFunds {
            escrow_intent_id: Uuid::nil(),
            computed: 9001,
            distributable: 9000,
        };
        assert!(!err.is_transient());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn signature_errors_are_not_retried() {
        assert!(!SettlementError::InvalidSignature.is_transient());
        assert_eq!(
            SettlementError::InvalidSignature.status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
