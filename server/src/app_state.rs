//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::config::SettlementConfig;
use crate::gateway::ProcessorGateway;
use crate::ledger::LedgerStore;
use crate::services::{
    CampaignWeighting, EarningsCalculator, OnboardingManager, PaymentIntake, PayoutDispatcher,
    WebhookReconciler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub onboarding: Arc<OnboardingManager>,
    pub intake: Arc<PaymentIntake>,
    pub earnings: Arc<EarningsCalculator>,
    pub reconciler: Arc<WebhookReconciler>,
    pub dispatcher: Arc<PayoutDispatcher>,
}

impl AppState {
    /// Wire every settlement service over one ledger and one processor gateway.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn ProcessorGateway>,
        weighting: Arc<dyn CampaignWeighting>,
        config: SettlementConfig,
    ) -> Self {
        let earnings = Arc::new(EarningsCalculator::new(
            ledger.clone(),
            weighting,
            config.platform_fee_bps,
        ));

        Self {
            onboarding: Arc::new(OnboardingManager::new(ledger.clone(), gateway.clone())),
            intake: Arc::new(PaymentIntake::new(ledger.clone(), gateway.clone())),
            reconciler: Arc::new(WebhookReconciler::new(
                ledger.clone(),
                gateway.clone(),
                earnings.clone(),
            )),
            dispatcher: Arc::new(PayoutDispatcher::new(ledger, gateway, config)),
            earnings,
        }
    }
}

impl FromRef<AppState> for Arc<OnboardingManager> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.onboarding.clone()
    }
}

impl FromRef<AppState> for Arc<PaymentIntake> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.intake.clone()
    }
}

impl FromRef<AppState> for Arc<EarningsCalculator> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.earnings.clone()
    }
}

impl FromRef<AppState> for Arc<WebhookReconciler> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.reconciler.clone()
    }
}

impl FromRef<AppState> for Arc<PayoutDispatcher> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.dispatcher.clone()
    }
}
