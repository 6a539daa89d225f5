//! Onboarding manager - connects creators to a processor account

use std::sync::Arc;

use uuid::Uuid;

use super::retry_once_on_conflict;
use crate::error::{SettlementError, SettlementResult};
use crate::gateway::ProcessorGateway;
use crate::ledger::LedgerStore;
use crate::models::{Account, OnboardingStatus, OnboardingStatusResponse};

pub struct OnboardingManager {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn ProcessorGateway>,
}

impl OnboardingManager {
    pub fn new(ledger: Arc<dyn LedgerStore>, gateway: Arc<dyn ProcessorGateway>) -> Self {
        Self { ledger, gateway }
    }

    /// Create the creator's connected account, or return it if it already exists.
    ///
    /// On a processor failure the account stays `NotStarted` and the call can be retried.
    pub async fn start_onboarding(&self, creator_id: Uuid) -> SettlementResult<Account> {
        retry_once_on_conflict(|| self.try_start_onboarding(creator_id)).await
    }

    async fn try_start_onboarding(&self, creator_id: Uuid) -> SettlementResult<Account> {
        let account = self.ledger.ensure_account(creator_id).await?;
        if account.external_account_id.is_some() {
            return Ok(account);
        }

        let external_account_id = self.gateway.create_account(creator_id).await.map_err(|err| {
            tracing::warn!(%creator_id, error = %err, "connected account creation failed");
            err
        })?;

        match self
            .ledger
            .attach_external_account(account.id, &external_account_id)
            .await?
        {
            Some(account) => {
                tracing::info!(
                    %creator_id,
                    external_account_id = %external_account_id,
                    "creator onboarding started"
                );
                Ok(account)
            }
            None => {
                // A concurrent request attached first; the processor deduplicates on the
                // creator id, so both saw the same external account.
                let current = self
                    .ledger
                    .find_account_by_creator(creator_id)
                    .await?
                    .ok_or(SettlementError::AccountNotFound)?;
                if current.external_account_id.is_some() {
                    Ok(current)
                } else {
                    Err(SettlementError::ConflictingState(format!(
                        "account for creator {creator_id} changed during onboarding"
                    )))
                }
            }
        }
    }

    /// Fresh onboarding URL for a creator whose connected account is not yet active.
    pub async fn create_account_link(&self, creator_id: Uuid) -> SettlementResult<String> {
        let account = self
            .ledger
            .find_account_by_creator(creator_id)
            .await?
            .ok_or(SettlementError::AccountNotFound)?;

        let external_account_id = account
            .external_account_id
            .as_deref()
            .ok_or(SettlementError::AccountNotFound)?;

        if account.onboarding_status == OnboardingStatus::Active {
            return Err(SettlementError::AccountAlreadyActive);
        }

        self.gateway.create_account_link(external_account_id).await
    }

    /// Persisted onboarding status. The processor is never polled here: status only moves
    /// on `account.updated` webhooks.
    pub async fn get_status(&self, creator_id: Uuid) -> SettlementResult<OnboardingStatusResponse> {
        let account = self.ledger.find_account_by_creator(creator_id).await?;

        Ok(match account {
            Some(account) => OnboardingStatusResponse {
                creator_id,
                status: account.onboarding_status,
                charges_enabled: account.charges_enabled,
                payouts_enabled: account.payouts_enabled,
            },
            None => OnboardingStatusResponse {
                creator_id,
                status: OnboardingStatus::NotStarted,
                charges_enabled: false,
                payouts_enabled: false,
            },
        })
    }

    pub async fn deactivate_account(&self, creator_id: Uuid) -> SettlementResult<Account> {
        let account = self
            .ledger
            .find_account_by_creator(creator_id)
            .await?
            .ok_or(SettlementError::AccountNotFound)?;

        let account = self
            .ledger
            .deactivate_account(account.id)
            .await?
            .ok_or(SettlementError::AccountNotFound)?;
        tracing::info!(%creator_id, "creator account deactivated");

        Ok(account)
    }
}
