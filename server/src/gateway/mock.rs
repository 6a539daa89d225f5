//! In-process processor double for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{PaymentIntentHandle, ProcessorEvent, ProcessorGateway, WebhookVerifier};
use crate::error::{SettlementError, SettlementResult};

pub const MOCK_WEBHOOK_SECRET: &str = "whsec_mock";

/// A payout the mock processor accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockPayout {
    pub external_payout_id: String,
    pub payout_request_id: Uuid,
    pub external_account_id: String,
    pub amount: i64,
    pub currency: String,
}

/// Processor double: honours idempotency keys the way the real processor does and
/// verifies webhooks with the real verifier.
pub struct MockProcessorGateway {
    verifier: WebhookVerifier,
    fail_accounts: AtomicBool,
    fail_payment_intents: AtomicBool,
    fail_payouts: AtomicBool,
    account_calls: AtomicUsize,
    payout_calls: AtomicUsize,
    accounts: Mutex<HashMap<Uuid, String>>,
    payouts: Mutex<Vec<MockPayout>>,
}

impl Default for MockProcessorGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProcessorGateway {
    pub fn new() -> Self {
        Self {
            verifier: WebhookVerifier::new(MOCK_WEBHOOK_SECRET, 300),
            fail_accounts: AtomicBool::new(false),
            fail_payment_intents: AtomicBool::new(false),
            fail_payouts: AtomicBool::new(false),
            account_calls: AtomicUsize::new(0),
            payout_calls: AtomicUsize::new(0),
            accounts: Mutex::new(HashMap::new()),
            payouts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail_accounts(&self, fail: bool) {
        self.fail_accounts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_payment_intents(&self, fail: bool) {
        self.fail_payment_intents.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_payouts(&self, fail: bool) {
        self.fail_payouts.store(fail, Ordering::SeqCst);
    }

    pub fn account_calls(&self) -> usize {
        self.account_calls.load(Ordering::SeqCst)
    }

    pub fn payout_calls(&self) -> usize {
        self.payout_calls.load(Ordering::SeqCst)
    }

    pub fn payouts(&self) -> Vec<MockPayout> {
        self.payouts
            .lock()
            .map(|payouts| payouts.clone())
            .unwrap_or_default()
    }

    /// Sign `payload` as the processor would for a delivery happening now.
    pub fn sign(&self, payload: &[u8]) -> String {
        self.verifier
            .sign(payload, Utc::now().timestamp())
            .unwrap_or_default()
    }
}

fn poisoned<T>(_: T) -> SettlementError {
    SettlementError::ProcessorUnavailable("mock processor state poisoned".to_string())
}

#[async_trait]
impl ProcessorGateway for MockProcessorGateway {
    async fn create_account(&self, creator_id: Uuid) -> SettlementResult<String> {
        self.account_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_accounts.load(Ordering::SeqCst) {
            return Err(SettlementError::ProcessorUnavailable(
                "mock account creation timed out".to_string(),
            ));
        }

        let mut accounts = self.accounts.lock().map_err(poisoned)?;
        let id = accounts
            .entry(creator_id)
            .or_insert_with(|| format!("acct_{}", creator_id.simple()))
            .clone();
        Ok(id)
    }

    async fn create_account_link(&self, external_account_id: &str) -> SettlementResult<String> {
        Ok(format!(
            "https://connect.processor.test/setup/{external_account_id}/{}",
            Uuid::new_v4().simple()
        ))
    }

    async fn create_payment_intent(
        &self,
        escrow_intent_id: Uuid,
        _amount: i64,
        _currency: &str,
    ) -> SettlementResult<PaymentIntentHandle> {
        if self.fail_payment_intents.load(Ordering::SeqCst) {
            return Err(SettlementError::ProcessorUnavailable(
                "mock payment intent creation timed out".to_string(),
            ));
        }

        let external_intent_id = format!("pi_{}", escrow_intent_id.simple());
        Ok(PaymentIntentHandle {
            client_token: format!("{external_intent_id}_secret"),
            external_intent_id,
        })
    }

    async fn create_payout(
        &self,
        payout_request_id: Uuid,
        external_account_id: &str,
        amount: i64,
        currency: &str,
    ) -> SettlementResult<String> {
        self.payout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_payouts.load(Ordering::SeqCst) {
            return Err(SettlementError::ProcessorUnavailable(
                "mock payout creation timed out".to_string(),
            ));
        }

        let mut payouts = self.payouts.lock().map_err(poisoned)?;
        if let Some(existing) = payouts
            .iter()
            .find(|payout| payout.payout_request_id == payout_request_id)
        {
            return Ok(existing.external_payout_id.clone());
        }

        let payout = MockPayout {
            external_payout_id: format!("po_{}", payout_request_id.simple()),
            payout_request_id,
            external_account_id: external_account_id.to_string(),
            amount,
            currency: currency.to_string(),
        };
        let id = payout.external_payout_id.clone();
        payouts.push(payout);
        Ok(id)
    }

    fn verify_webhook(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> SettlementResult<ProcessorEvent> {
        self.verifier.verify(raw_payload, signature_header)?;
        ProcessorEvent::parse(raw_payload)
    }
}
