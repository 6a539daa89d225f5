//! Business logic services for settlement

pub mod dispatcher;
pub mod earnings;
pub mod intake;
pub mod onboarding;
pub mod reconciler;

pub use dispatcher::{PayoutCycleReport, PayoutDispatcher, PayoutScheduler};
pub use earnings::{
    CampaignWeighting, CreatorWeight, EarningsCalculator, PgContentWeighting, StaticWeighting,
};
pub use intake::PaymentIntake;
pub use onboarding::OnboardingManager;
pub use reconciler::{ReconcileOutcome, WebhookReconciler};

use std::future::Future;

use crate::error::{SettlementError, SettlementResult};

/// Run `op`, re-running it once if it lost an optimistic update race.
///
/// `op` must re-read the state it depends on, so the second attempt observes the winner's
/// write. A second conflict is surfaced to the caller.
pub(crate) async fn retry_once_on_conflict<T, F, Fut>(mut op: F) -> SettlementResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SettlementResult<T>>,
{
    match op().await {
        Err(SettlementError::ConflictingState(reason)) => {
            tracing::debug!(%reason, "ledger update lost a race, retrying once");
            op().await
        }
        other => other,
    }
}
