//! Webhook reconciler - applies verified processor events to the ledger
//!
//! Every transition is guarded by the current persisted state, so redelivered and
//! out-of-order events settle to the same ledger as a single in-order delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{retry_once_on_conflict, EarningsCalculator};
use crate::error::{SettlementError, SettlementResult};
use crate::gateway::{EventKind, ProcessorEvent, ProcessorGateway};
use crate::ledger::LedgerStore;
use crate::models::{AccountCapabilities, EscrowStatus, OnboardingStatus, PayoutRequest, PayoutStatus};

/// What processing one event did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// State moved.
    Applied,
    /// The ledger already reflected the event.
    Duplicate,
    /// Valid event with nothing to do (unknown type, terminal target, stale).
    Ignored,
    /// No ledger entity carries the referenced processor id.
    Unmatched,
}

/// Onboarding status implied by an account's capability flags.
pub fn derive_onboarding_status(
    charges_enabled: bool,
    payouts_enabled: bool,
    disabled_reason: Option<&str>,
    past_due: &[String],
) -> OnboardingStatus {
    if charges_enabled && payouts_enabled {
        OnboardingStatus::Active
    } else if disabled_reason.is_some() || !past_due.is_empty() {
        OnboardingStatus::Restricted
    } else {
        OnboardingStatus::Pending
    }
}

pub struct WebhookReconciler {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn ProcessorGateway>,
    earnings: Arc<EarningsCalculator>,
}

impl WebhookReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn ProcessorGateway>,
        earnings: Arc<EarningsCalculator>,
    ) -> Self {
        Self {
            ledger,
            gateway,
            earnings,
        }
    }

    /// Verify, parse and apply one raw webhook delivery.
    pub async fn handle_webhook_event(
        &self,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> SettlementResult<ReconcileOutcome> {
        let event = match self.gateway.verify_webhook(raw_payload, signature_header) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "rejected processor webhook");
                return Err(err);
            }
        };

        tracing::debug!(
            event_id = %event.id,
            event_type = event.event_type(),
            "processor event received"
        );

        let outcome = self.apply_event(&event).await?;
        tracing::info!(
            event_id = %event.id,
            event_type = event.event_type(),
            ?outcome,
            "processor event reconciled"
        );
        Ok(outcome)
    }

    /// Apply an already verified event.
    pub async fn apply_event(&self, event: &ProcessorEvent) -> SettlementResult<ReconcileOutcome> {
        retry_once_on_conflict(|| self.try_apply(event)).await
    }

    async fn try_apply(&self, event: &ProcessorEvent) -> SettlementResult<ReconcileOutcome> {
        match &event.kind {
            EventKind::PaymentIntentSucceeded { intent_id } => self.payment_succeeded(intent_id).await,
            EventKind::PaymentIntentRequiresAction { intent_id } => {
                self.advance_escrow(
                    intent_id,
                    &[EscrowStatus::Created],
                    EscrowStatus::RequiresAction,
                    None,
                )
                .await
            }
            EventKind::PaymentIntentFailed { intent_id, reason } => {
                self.advance_escrow(
                    intent_id,
                    &[EscrowStatus::Created, EscrowStatus::RequiresAction],
                    EscrowStatus::Failed,
                    reason.as_deref(),
                )
                .await
            }
            EventKind::PaymentIntentCanceled { intent_id, reason } => {
                self.advance_escrow(
                    intent_id,
                    &[EscrowStatus::Created, EscrowStatus::RequiresAction],
                    EscrowStatus::Canceled,
                    reason.as_deref(),
                )
                .await
            }
            EventKind::AccountUpdated {
                account_id,
                charges_enabled,
                payouts_enabled,
                disabled_reason,
                past_due,
            } => {
                let capabilities = AccountCapabilities {
                    status: derive_onboarding_status(
                        *charges_enabled,
                        *payouts_enabled,
                        disabled_reason.as_deref(),
                        past_due,
                    ),
                    charges_enabled: *charges_enabled,
                    payouts_enabled: *payouts_enabled,
                    observed_at: event.created,
                };
                self.account_updated(account_id, &capabilities).await
            }
            EventKind::PayoutInTransit {
                payout_id,
                payout_request_id,
            } => {
                let Some(request) = self.resolve_payout(payout_id, *payout_request_id).await? else {
                    return Ok(unmatched("payout", payout_id));
                };
                self.payout_in_transit(request).await
            }
            EventKind::PayoutPaid {
                payout_id,
                payout_request_id,
            } => {
                let Some(request) = self.resolve_payout(payout_id, *payout_request_id).await? else {
                    return Ok(unmatched("payout", payout_id));
                };
                self.payout_paid(request, event.created).await
            }
            EventKind::PayoutFailed {
                payout_id,
                payout_request_id,
                reason,
            } => {
                let Some(request) = self.resolve_payout(payout_id, *payout_request_id).await? else {
                    return Ok(unmatched("payout", payout_id));
                };
                self.payout_failed(request, reason.as_deref().unwrap_or("payout failed"))
                    .await
            }
            EventKind::Ignored { event_type } => {
                tracing::debug!(%event_type, "ignoring unhandled processor event type");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn payment_succeeded(&self, intent_id: &str) -> SettlementResult<ReconcileOutcome> {
        let Some(escrow) = self.ledger.find_escrow_by_external(intent_id).await? else {
            return Ok(unmatched("payment intent", intent_id));
        };

        let outcome = match escrow.status {
            EscrowStatus::Succeeded => ReconcileOutcome::Duplicate,
            EscrowStatus::Failed | EscrowStatus::Canceled => {
                tracing::warn!(
                    escrow_intent_id = %escrow.id,
                    status = ?escrow.status,
                    "success reported for a closed escrow; ignoring"
                );
                return Ok(ReconcileOutcome::Ignored);
            }
            EscrowStatus::Created | EscrowStatus::RequiresAction => {
                self.ledger
                    .transition_escrow(
                        escrow.id,
                        &[EscrowStatus::Created, EscrowStatus::RequiresAction],
                        EscrowStatus::Succeeded,
                        None,
                    )
                    .await?
                    .ok_or_else(|| lost_race("escrow", &escrow.id.to_string()))?;
                tracing::info!(escrow_intent_id = %escrow.id, amount = escrow.amount, "escrow funded");
                ReconcileOutcome::Applied
            }
        };

        // Runs on redelivery as well, healing a crash between the transition and the write.
        self.earnings.materialize_earnings(escrow.id).await?;
        Ok(outcome)
    }

    async fn advance_escrow(
        &self,
        intent_id: &str,
        from: &[EscrowStatus],
        to: EscrowStatus,
        failure_reason: Option<&str>,
    ) -> SettlementResult<ReconcileOutcome> {
        let Some(escrow) = self.ledger.find_escrow_by_external(intent_id).await? else {
            return Ok(unmatched("payment intent", intent_id));
        };

        if escrow.status == to {
            return Ok(ReconcileOutcome::Duplicate);
        }
        if escrow.status.is_terminal() {
            tracing::warn!(
                escrow_intent_id = %escrow.id,
                current = ?escrow.status,
                target = ?to,
                "escrow already closed; ignoring"
            );
            return Ok(ReconcileOutcome::Ignored);
        }
        if !from.contains(&escrow.status) {
            tracing::warn!(
                escrow_intent_id = %escrow.id,
                current = ?escrow.status,
                target = ?to,
                "escrow cannot move to reported state; ignoring"
            );
            return Ok(ReconcileOutcome::Ignored);
        }

        self.ledger
            .transition_escrow(escrow.id, from, to, failure_reason)
            .await?
            .ok_or_else(|| lost_race("escrow", &escrow.id.to_string()))?;
        tracing::info!(escrow_intent_id = %escrow.id, status = ?to, "escrow status updated");

        Ok(ReconcileOutcome::Applied)
    }

    async fn account_updated(
        &self,
        external_account_id: &str,
        capabilities: &AccountCapabilities,
    ) -> SettlementResult<ReconcileOutcome> {
        let Some(account) = self
            .ledger
            .find_account_by_external(external_account_id)
            .await?
        else {
            return Ok(unmatched("account", external_account_id));
        };

        match self
            .ledger
            .apply_account_capabilities(account.id, capabilities)
            .await?
        {
            Some(updated) => {
                if updated.onboarding_status != account.onboarding_status {
                    tracing::info!(
                        creator_id = %updated.creator_id,
                        from = ?account.onboarding_status,
                        to = ?updated.onboarding_status,
                        "onboarding status changed"
                    );
                }
                Ok(ReconcileOutcome::Applied)
            }
            None => {
                tracing::debug!(
                    creator_id = %account.creator_id,
                    observed_at = %capabilities.observed_at,
                    "discarding stale account update"
                );
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    /// Find the request a payout event refers to: by processor payout id, else by the
    /// request id the dispatcher put in the payout metadata.
    async fn resolve_payout(
        &self,
        external_payout_id: &str,
        payout_request_id: Option<uuid::Uuid>,
    ) -> SettlementResult<Option<PayoutRequest>> {
        if let Some(request) = self.ledger.find_payout_by_external(external_payout_id).await? {
            return Ok(Some(request));
        }
        let Some(request_id) = payout_request_id else {
            return Ok(None);
        };
        let Some(request) = self.ledger.get_payout_request(request_id).await? else {
            return Ok(None);
        };

        // The submit response never reached the ledger; adopt the id from the event.
        if request.external_payout_id.is_none() {
            if let Some(attached) = self
                .ledger
                .mark_payout_submitted(request.id, external_payout_id)
                .await?
            {
                return Ok(Some(attached));
            }
        }
        Ok(Some(request))
    }

    async fn payout_in_transit(&self, request: PayoutRequest) -> SettlementResult<ReconcileOutcome> {
        if request.status.is_terminal() {
            return Ok(ReconcileOutcome::Ignored);
        }
        if request.status == PayoutStatus::InTransit {
            return Ok(ReconcileOutcome::Duplicate);
        }

        self.ledger
            .mark_payout_in_transit(request.id)
            .await?
            .ok_or_else(|| lost_race("payout request", &request.id.to_string()))?;
        tracing::info!(payout_request_id = %request.id, "payout in transit");

        Ok(ReconcileOutcome::Applied)
    }

    async fn payout_paid(
        &self,
        request: PayoutRequest,
        reported_at: DateTime<Utc>,
    ) -> SettlementResult<ReconcileOutcome> {
        match request.status {
            PayoutStatus::Paid => return Ok(ReconcileOutcome::Duplicate),
            PayoutStatus::Failed => {
                let covered = self.ledger.earnings_for_payout(request.id).await?;
                let earning_ids: Vec<String> =
                    covered.iter().map(|earning| earning.id.to_string()).collect();
                tracing::error!(
                    payout_request_id = %request.id,
                    amount = request.amount,
                    %reported_at,
                    earning_ids = %earning_ids.join(","),
                    "processor reports payout paid for a request already failed; manual review required"
                );
                return Ok(ReconcileOutcome::Ignored);
            }
            PayoutStatus::Requested | PayoutStatus::InTransit => {}
        }

        let paid = self
            .ledger
            .complete_payout_request(request.id)
            .await?
            .ok_or_else(|| lost_race("payout request", &request.id.to_string()))?;
        tracing::info!(
            payout_request_id = %paid.id,
            account_id = %paid.account_id,
            amount = paid.amount,
            currency = %paid.currency,
            "payout paid"
        );

        Ok(ReconcileOutcome::Applied)
    }

    async fn payout_failed(
        &self,
        request: PayoutRequest,
        reason: &str,
    ) -> SettlementResult<ReconcileOutcome> {
        match request.status {
            PayoutStatus::Failed => return Ok(ReconcileOutcome::Duplicate),
            PayoutStatus::Paid => {
                tracing::warn!(
                    payout_request_id = %request.id,
                    %reason,
                    "failure reported for a paid payout; ignoring"
                );
                return Ok(ReconcileOutcome::Ignored);
            }
            PayoutStatus::Requested | PayoutStatus::InTransit => {}
        }

        self.ledger
            .fail_payout_request(request.id, reason)
            .await?
            .ok_or_else(|| lost_race("payout request", &request.id.to_string()))?;
        tracing::warn!(
            payout_request_id = %request.id,
            %reason,
            "payout failed; earnings released"
        );

        Ok(ReconcileOutcome::Applied)
    }
}

fn unmatched(entity: &str, external_id: &str) -> ReconcileOutcome {
    tracing::warn!(%entity, %external_id, "processor event references unknown entity");
    ReconcileOutcome::Unmatched
}

fn lost_race(entity: &str, id: &str) -> SettlementError {
    SettlementError::ConflictingState(format!("{entity} {id} changed concurrently"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fully_enabled_account_is_active() {
        assert_eq!(
            derive_onboarding_status(true, true, None, &[]),
            OnboardingStatus::Active
        );
    }

    #[test]
    fn disabled_reason_restricts() {
        assert_eq!(
            derive_onboarding_status(true, false, Some("requirements.past_due"), &[]),
            OnboardingStatus::Restricted
        );
    }

    #[test]
    fn past_due_requirements_restrict() {
        assert_eq!(
            derive_onboarding_status(false, false, None, &["external_account".to_string()]),
            OnboardingStatus::Restricted
        );
    }

    #[test]
    fn partially_enabled_account_is_pending() {
        assert_eq!(
            derive_onboarding_status(true, false, None, &[]),
            OnboardingStatus::Pending
        );
    }
}
