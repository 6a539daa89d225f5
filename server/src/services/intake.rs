//! Payment intake - brand payments into escrow

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{SettlementError, SettlementResult};
use crate::gateway::ProcessorGateway;
use crate::ledger::LedgerStore;
use crate::models::{CreateEscrowResponse, EscrowIntent, NewEscrowIntent};

pub struct PaymentIntake {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn ProcessorGateway>,
}

impl PaymentIntake {
    pub fn new(ledger: Arc<dyn LedgerStore>, gateway: Arc<dyn ProcessorGateway>) -> Self {
        Self { ledger, gateway }
    }

    /// Open a processor payment intent for a brand payment and record it as `Created`.
    ///
    /// The escrow only advances when the processor confirms the payment by webhook.
    pub async fn create_escrow(
        &self,
        campaign_id: Uuid,
        brand_id: Uuid,
        amount: i64,
        currency: &str,
    ) -> SettlementResult<CreateEscrowResponse> {
        if amount <= 0 {
            return Err(SettlementError::InvalidAmount);
        }
        let currency = currency.trim().to_ascii_lowercase();

        let escrow_intent_id = Uuid::new_v4();
        let intent = self
            .gateway
            .create_payment_intent(escrow_intent_id, amount, &currency)
            .await
            .map_err(|err| {
                tracing::warn!(%campaign_id, %brand_id, error = %err, "payment intent creation failed");
                err
            })?;

        let escrow = self
            .ledger
            .insert_escrow(NewEscrowIntent {
                id: escrow_intent_id,
                campaign_id,
                brand_id,
                amount,
                currency,
                external_intent_id: intent.external_intent_id,
            })
            .await?;

        tracing::info!(
            escrow_intent_id = %escrow.id,
            %campaign_id,
            amount,
            currency = %escrow.currency,
            "escrow intent created"
        );

        Ok(CreateEscrowResponse {
            escrow_intent_id: escrow.id,
            external_intent_id: escrow.external_intent_id,
            client_token: intent.client_token,
            status: escrow.status,
        })
    }

    pub async fn get_escrow(&self, id: Uuid) -> SettlementResult<EscrowIntent> {
        self.ledger
            .get_escrow(id)
            .await?
            .ok_or(SettlementError::EscrowNotFound)
    }
}
