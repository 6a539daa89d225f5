#![allow(dead_code)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use creatorpay_server::app_state::AppState;
use creatorpay_server::config::SettlementConfig;
use creatorpay_server::error::SettlementResult;
use creatorpay_server::gateway::MockProcessorGateway;
use creatorpay_server::ledger::MemoryLedgerStore;
use creatorpay_server::services::{CreatorWeight, ReconcileOutcome, StaticWeighting};

pub const MIN_PAYOUT: i64 = 1_000;

/// Services over an in-memory ledger and the mock processor, with one weighted campaign.
pub struct Harness {
    pub ledger: Arc<MemoryLedgerStore>,
    pub gateway: Arc<MockProcessorGateway>,
    pub state: AppState,
    pub campaign_id: Uuid,
    pub creators: Vec<Uuid>,
}

impl Harness {
    /// 10% platform fee, two creators weighted 2:1.
    pub fn new() -> Self {
        Self::with_weights(1_000, &[2, 1])
    }

    pub fn with_weights(platform_fee_bps: u32, weights: &[u64]) -> Self {
        let campaign_id = Uuid::new_v4();
        let creators: Vec<Uuid> = weights.iter().map(|_| Uuid::new_v4()).collect();
        let weighting = StaticWeighting::new().with_campaign(
            campaign_id,
            creators
                .iter()
                .zip(weights)
                .map(|(creator_id, weight)| CreatorWeight {
                    creator_id: *creator_id,
                    weight: *weight,
                })
                .collect(),
        );
        let config = SettlementConfig {
            platform_fee_bps,
            holding_period: Duration::zero(),
            min_payout_amount: MIN_PAYOUT,
            scheduler_enabled: false,
            ..SettlementConfig::default()
        };

        let ledger = Arc::new(MemoryLedgerStore::new());
        let gateway = Arc::new(MockProcessorGateway::new());
        let state = AppState::new(ledger.clone(), gateway.clone(), Arc::new(weighting), config);

        Self {
            ledger,
            gateway,
            state,
            campaign_id,
            creators,
        }
    }

    /// Sign `payload` with the processor secret and hand it to the reconciler.
    pub async fn deliver(&self, payload: &[u8]) -> SettlementResult<ReconcileOutcome> {
        let signature = self.gateway.sign(payload);
        self.state
            .reconciler
            .handle_webhook_event(payload, &signature)
            .await
    }

    /// Open an escrow for the campaign without confirming it.
    pub async fn open_escrow(&self, amount: i64) -> (Uuid, String) {
        let escrow = self
            .state
            .intake
            .create_escrow(self.campaign_id, Uuid::new_v4(), amount, "usd")
            .await
            .unwrap();
        (escrow.escrow_intent_id, escrow.external_intent_id)
    }

    /// Open an escrow and confirm it with a `payment_intent.succeeded` event.
    pub async fn fund_escrow(&self, amount: i64) -> Uuid {
        let (escrow_id, intent_id) = self.open_escrow(amount).await;
        let outcome = self
            .deliver(&event("payment_intent.succeeded", json!({ "id": intent_id })))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
        escrow_id
    }

    /// Onboard the creator and report its processor account as fully enabled.
    pub async fn activate(&self, creator_id: Uuid) -> String {
        let account = self
            .state
            .onboarding
            .start_onboarding(creator_id)
            .await
            .unwrap();
        let external_account_id = account.external_account_id.unwrap();
        let outcome = self
            .deliver(&event(
                "account.updated",
                json!({
                    "id": external_account_id,
                    "charges_enabled": true,
                    "payouts_enabled": true,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);
        external_account_id
    }
}

pub fn event(event_type: &str, object: Value) -> Vec<u8> {
    event_at(event_type, object, Utc::now().timestamp())
}

pub fn event_at(event_type: &str, object: Value, created: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "created": created,
        "data": { "object": object },
    }))
    .unwrap()
}
