//! Outbound adapter to the payment processor

pub mod events;
mod http;
mod mock;
pub mod signature;

pub use events::{EventKind, ProcessorEvent};
pub use http::HttpProcessorGateway;
pub use mock::{MockPayout, MockProcessorGateway};
pub use signature::WebhookVerifier;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::SettlementResult;

/// Processor-side payment intent created for an escrow
#[derive(Debug, Clone)]
pub struct PaymentIntentHandle {
    pub external_intent_id: String,
    /// Opaque token the brand's client uses to confirm the payment.
    pub client_token: String,
}

/// Capabilities the settlement engine needs from the payment processor.
///
/// Create calls carry the platform-side id so implementations can derive an idempotency
/// key from it: retrying a create after a timeout must return the object created by the
/// first attempt rather than a second one.
#[async_trait]
pub trait ProcessorGateway: Send + Sync {
    async fn create_account(&self, creator_id: Uuid) -> SettlementResult<String>;

    async fn create_account_link(&self, external_account_id: &str) -> SettlementResult<String>;

    async fn create_payment_intent(
        &self,
        escrow_intent_id: Uuid,
        amount: i64,
        currency: &str,
    ) -> SettlementResult<PaymentIntentHandle>;

    async fn create_payout(
        &self,
        payout_request_id: Uuid,
        external_account_id: &str,
        amount: i64,
        currency: &str,
    ) -> SettlementResult<String>;

    /// Authenticate a webhook delivery and parse it into a typed event.
    fn verify_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> SettlementResult<ProcessorEvent>;
}
