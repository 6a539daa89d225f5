//! In-process ledger used by tests and by local runs without a database.
//!
//! Each trait call holds the table lock for its whole body and performs no I/O, which gives
//! the same all-or-nothing semantics the Postgres store gets from transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{LedgerStore, OPEN_PAYOUT_STATES};
use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    Account, AccountCapabilities, Earning, EarningStatus, EscrowIntent, EscrowStatus,
    NewEarning, NewEscrowIntent, OnboardingStatus, PayoutRequest, PayoutStatus,
};

#[derive(Default)]
struct Tables {
    accounts: Vec<Account>,
    escrows: Vec<EscrowIntent>,
    earnings: Vec<Earning>,
    payouts: Vec<PayoutRequest>,
    /// (payout request, earning) pairs, append-only.
    coverage: Vec<(Uuid, Uuid)>,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payout request ever created, oldest first.
    pub async fn all_payout_requests(&self) -> Vec<PayoutRequest> {
        self.tables.lock().await.payouts.clone()
    }

    /// Every earning ever written, oldest first.
    pub async fn all_earnings(&self) -> Vec<Earning> {
        self.tables.lock().await.earnings.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_account_by_creator(&self, creator_id: Uuid) -> SettlementResult<Option<Account>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .accounts
            .iter()
            .find(|account| account.creator_id == creator_id)
            .cloned())
    }

    async fn find_account_by_external(
        &self,
        external_account_id: &str,
    ) -> SettlementResult<Option<Account>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .accounts
            .iter()
            .find(|account| account.external_account_id.as_deref() == Some(external_account_id))
            .cloned())
    }

    async fn ensure_account(&self, creator_id: Uuid) -> SettlementResult<Account> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .accounts
            .iter()
            .find(|account| account.creator_id == creator_id)
        {
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4(),
            creator_id,
            external_account_id: None,
            onboarding_status: OnboardingStatus::NotStarted,
            charges_enabled: false,
            payouts_enabled: false,
            active: true,
            status_observed_at: None,
            created_at: now,
            updated_at: now,
        };
        tables.accounts.push(account.clone());
        Ok(account)
    }

    async fn attach_external_account(
        &self,
        account_id: Uuid,
        external_account_id: &str,
    ) -> SettlementResult<Option<Account>> {
        let mut tables = self.tables.lock().await;
        if tables.accounts.iter().any(|account| {
            account.id != account_id
                && account.external_account_id.as_deref() == Some(external_account_id)
        }) {
            return Err(SettlementError::ConflictingState(format!(
                "external account {external_account_id} is attached to another creator"
            )));
        }

        let Some(account) = tables.accounts.iter_mut().find(|a| a.id == account_id) else {
            return Ok(None);
        };
        if account.external_account_id.is_some()
            || account.onboarding_status != OnboardingStatus::NotStarted
        {
            return Ok(None);
        }

        account.external_account_id = Some(external_account_id.to_string());
        account.onboarding_status = OnboardingStatus::Pending;
        account.updated_at = Utc::now();
        Ok(Some(account.clone()))
    }

    async fn apply_account_capabilities(
        &self,
        account_id: Uuid,
        capabilities: &AccountCapabilities,
    ) -> SettlementResult<Option<Account>> {
        let mut tables = self.tables.lock().await;
        let Some(account) = tables.accounts.iter_mut().find(|a| a.id == account_id) else {
            return Ok(None);
        };
        if matches!(account.status_observed_at, Some(seen) if seen > capabilities.observed_at) {
            return Ok(None);
        }

        account.onboarding_status = capabilities.status;
        account.charges_enabled = capabilities.charges_enabled;
        account.payouts_enabled = capabilities.payouts_enabled;
        account.status_observed_at = Some(capabilities.observed_at);
        account.updated_at = Utc::now();
        Ok(Some(account.clone()))
    }

    async fn deactivate_account(&self, account_id: Uuid) -> SettlementResult<Option<Account>> {
        let mut tables = self.tables.lock().await;
        let Some(account) = tables.accounts.iter_mut().find(|a| a.id == account_id) else {
            return Ok(None);
        };
        account.active = false;
        account.updated_at = Utc::now();
        Ok(Some(account.clone()))
    }

    async fn insert_escrow(&self, escrow: NewEscrowIntent) -> SettlementResult<EscrowIntent> {
        let mut tables = self.tables.lock().await;
        if tables
            .escrows
            .iter()
            .any(|e| e.id == escrow.id || e.external_intent_id == escrow.external_intent_id)
        {
            return Err(SettlementError::ConflictingState(format!(
                "escrow intent {} already recorded",
                escrow.external_intent_id
            )));
        }

        let now = Utc::now();
        let record = EscrowIntent {
            id: escrow.id,
            campaign_id: escrow.campaign_id,
            brand_id: escrow.brand_id,
            amount: escrow.amount,
            currency: escrow.currency,
            external_intent_id: escrow.external_intent_id,
            status: EscrowStatus::Created,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        tables.escrows.push(record.clone());
        Ok(record)
    }

    async fn get_escrow(&self, id: Uuid) -> SettlementResult<Option<EscrowIntent>> {
        let tables = self.tables.lock().await;
        Ok(tables.escrows.iter().find(|e| e.id == id).cloned())
    }

    async fn find_escrow_by_external(
        &self,
        external_intent_id: &str,
    ) -> SettlementResult<Option<EscrowIntent>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .escrows
            .iter()
            .find(|e| e.external_intent_id == external_intent_id)
            .cloned())
    }

    async fn transition_escrow(
        &self,
        id: Uuid,
        from: &[EscrowStatus],
        to: EscrowStatus,
        failure_reason: Option<&str>,
    ) -> SettlementResult<Option<EscrowIntent>> {
        let mut tables = self.tables.lock().await;
        let Some(escrow) = tables.escrows.iter_mut().find(|e| e.id == id) else {
            return Ok(None);
        };
        if !from.contains(&escrow.status) {
            return Ok(None);
        }

        escrow.status = to;
        if let Some(reason) = failure_reason {
            escrow.failure_reason = Some(reason.to_string());
        }
        escrow.updated_at = Utc::now();
        Ok(Some(escrow.clone()))
    }

    async fn insert_earnings_once(
        &self,
        escrow_intent_id: Uuid,
        earnings: Vec<NewEarning>,
    ) -> SettlementResult<Vec<Earning>> {
        let mut tables = self.tables.lock().await;
        let existing: Vec<Earning> = tables
            .earnings
            .iter()
            .filter(|e| e.escrow_intent_id == escrow_intent_id)
            .cloned()
            .collect();
        if !existing.is_empty() {
            return Ok(existing);
        }

        if earnings.iter().any(|new| {
            tables
                .earnings
                .iter()
                .any(|e| e.idempotency_key == new.idempotency_key)
        }) {
            return Err(SettlementError::ConflictingState(format!(
                "earning idempotency key reused for escrow intent {escrow_intent_id}"
            )));
        }

        let now = Utc::now();
        let inserted: Vec<Earning> = earnings
            .into_iter()
            .map(|new| Earning {
                id: Uuid::new_v4(),
                account_id: new.account_id,
                creator_id: new.creator_id,
                escrow_intent_id,
                amount: new.amount,
                currency: new.currency,
                status: EarningStatus::Pending,
                idempotency_key: new.idempotency_key,
                payout_request_id: None,
                created_at: now,
                updated_at: now,
            })
            .collect();
        tables.earnings.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn earnings_for_escrow(&self, escrow_intent_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .earnings
            .iter()
            .filter(|e| e.escrow_intent_id == escrow_intent_id)
            .cloned()
            .collect())
    }

    async fn earnings_for_account(&self, account_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .earnings
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn earnings_for_payout(&self, payout_request_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .earnings
            .iter()
            .filter(|e| tables.coverage.contains(&(payout_request_id, e.id)))
            .cloned()
            .collect())
    }

    async fn promote_matured_earnings(&self, cutoff: DateTime<Utc>) -> SettlementResult<u64> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut promoted = 0;
        for earning in tables
            .earnings
            .iter_mut()
            .filter(|e| e.status == EarningStatus::Pending && e.created_at <= cutoff)
        {
            earning.status = EarningStatus::Payable;
            earning.updated_at = now;
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn payable_earnings(&self) -> SettlementResult<Vec<Earning>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .earnings
            .iter()
            .filter(|e| e.status == EarningStatus::Payable)
            .filter(|e| {
                tables.accounts.iter().any(|a| {
                    a.id == e.account_id
                        && a.active
                        && a.onboarding_status == OnboardingStatus::Active
                })
            })
            .cloned()
            .collect())
    }

    async fn create_payout_request(
        &self,
        account_id: Uuid,
        currency: &str,
    ) -> SettlementResult<PayoutRequest> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let request = PayoutRequest {
            id: Uuid::new_v4(),
            account_id,
            external_payout_id: None,
            amount: 0,
            currency: currency.to_string(),
            status: PayoutStatus::Requested,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        tables.payouts.push(request.clone());
        Ok(request)
    }

    async fn claim_earnings(
        &self,
        payout_request_id: Uuid,
        earning_ids: &[Uuid],
    ) -> SettlementResult<Vec<Earning>> {
        let mut tables = self.tables.lock().await;
        let Some(request) = tables.payouts.iter().find(|p| p.id == payout_request_id) else {
            return Ok(Vec::new());
        };
        if request.status != PayoutStatus::Requested {
            return Ok(Vec::new());
        }
        let (account_id, currency) = (request.account_id, request.currency.clone());

        let now = Utc::now();
        let mut claimed = Vec::new();
        for earning in tables.earnings.iter_mut().filter(|e| {
            earning_ids.contains(&e.id)
                && e.status == EarningStatus::Payable
                && e.account_id == account_id
                && e.currency == currency
        }) {
            earning.status = EarningStatus::InPayout;
            earning.payout_request_id = Some(payout_request_id);
            earning.updated_at = now;
            claimed.push(earning.clone());
        }

        tables
            .coverage
            .extend(claimed.iter().map(|e| (payout_request_id, e.id)));

        let total: i64 = claimed.iter().map(|e| e.amount).sum();
        if let Some(request) = tables.payouts.iter_mut().find(|p| p.id == payout_request_id) {
            request.amount = total;
            request.updated_at = now;
        }
        Ok(claimed)
    }

    async fn mark_payout_submitted(
        &self,
        payout_request_id: Uuid,
        external_payout_id: &str,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let mut tables = self.tables.lock().await;
        let Some(request) = tables
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_request_id && p.external_payout_id.is_none())
        else {
            return Ok(None);
        };
        request.external_payout_id = Some(external_payout_id.to_string());
        request.updated_at = Utc::now();
        Ok(Some(request.clone()))
    }

    async fn mark_payout_in_transit(
        &self,
        payout_request_id: Uuid,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let mut tables = self.tables.lock().await;
        let Some(request) = tables
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_request_id && p.status == PayoutStatus::Requested)
        else {
            return Ok(None);
        };
        request.status = PayoutStatus::InTransit;
        request.updated_at = Utc::now();
        Ok(Some(request.clone()))
    }

    async fn complete_payout_request(
        &self,
        payout_request_id: Uuid,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let Some(request) = tables
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_request_id && OPEN_PAYOUT_STATES.contains(&p.status))
        else {
            return Ok(None);
        };
        request.status = PayoutStatus::Paid;
        request.updated_at = now;
        let completed = request.clone();

        for earning in tables.earnings.iter_mut().filter(|e| {
            e.payout_request_id == Some(payout_request_id) && e.status == EarningStatus::InPayout
        }) {
            earning.status = EarningStatus::Paid;
            earning.updated_at = now;
        }
        Ok(Some(completed))
    }

    async fn fail_payout_request(
        &self,
        payout_request_id: Uuid,
        reason: &str,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let Some(request) = tables
            .payouts
            .iter_mut()
            .find(|p| p.id == payout_request_id && OPEN_PAYOUT_STATES.contains(&p.status))
        else {
            return Ok(None);
        };
        request.status = PayoutStatus::Failed;
        request.failure_reason = Some(reason.to_string());
        request.updated_at = now;
        let failed = request.clone();

        for earning in tables.earnings.iter_mut().filter(|e| {
            e.payout_request_id == Some(payout_request_id) && e.status == EarningStatus::InPayout
        }) {
            earning.status = EarningStatus::Payable;
            earning.payout_request_id = None;
            earning.updated_at = now;
        }
        Ok(Some(failed))
    }

    async fn unsubmitted_payout_requests(
        &self,
        created_before: DateTime<Utc>,
    ) -> SettlementResult<Vec<PayoutRequest>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payouts
            .iter()
            .filter(|p| {
                p.status == PayoutStatus::Requested
                    && p.external_payout_id.is_none()
                    && p.created_at <= created_before
            })
            .cloned()
            .collect())
    }

    async fn get_payout_request(&self, id: Uuid) -> SettlementResult<Option<PayoutRequest>> {
        let tables = self.tables.lock().await;
        Ok(tables.payouts.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payout_by_external(
        &self,
        external_payout_id: &str,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .payouts
            .iter()
            .find(|p| p.external_payout_id.as_deref() == Some(external_payout_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_earning(account: &Account, key: &str, amount: i64) -> NewEarning {
        NewEarning {
            account_id: account.id,
            creator_id: account.creator_id,
            amount,
            currency: "usd".to_string(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn ensure_account_is_idempotent() {
        let store = MemoryLedgerStore::new();
        let creator = Uuid::new_v4();
        let first = store.ensure_account(creator).await.unwrap();
        let second = store.ensure_account(creator).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.onboarding_status, OnboardingStatus::NotStarted);
    }

    #[tokio::test]
    async fn attach_external_account_only_once() {
        let store = MemoryLedgerStore::new();
        let account = store.ensure_account(Uuid::new_v4()).await.unwrap();
        let attached = store
            .attach_external_account(account.id, "acct_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attached.onboarding_status, OnboardingStatus::Pending);
        assert!(store
            .attach_external_account(account.id, "acct_2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn second_earnings_insert_returns_first_set() {
        let store = MemoryLedgerStore::new();
        let account = store.ensure_account(Uuid::new_v4()).await.unwrap();
        let escrow_id = Uuid::new_v4();

        let first = store
            .insert_earnings_once(escrow_id, vec![new_earning(&account, "k1", 700)])
            .await
            .unwrap();
        let second = store
            .insert_earnings_once(escrow_id, vec![new_earning(&account, "k1", 900)])
            .await
            .unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].amount, 700);
    }

    #[tokio::test]
    async fn claim_skips_already_claimed_rows() {
        let store = MemoryLedgerStore::new();
        let account = store.ensure_account(Uuid::new_v4()).await.unwrap();
        let earnings = store
            .insert_earnings_once(Uuid::new_v4(), vec![new_earning(&account, "k1", 1500)])
            .await
            .unwrap();
        store.promote_matured_earnings(Utc::now()).await.unwrap();
        let ids: Vec<Uuid> = earnings.iter().map(|e| e.id).collect();

        let first = store.create_payout_request(account.id, "usd").await.unwrap();
        let second = store.create_payout_request(account.id, "usd").await.unwrap();

        assert_eq!(store.claim_earnings(first.id, &ids).await.unwrap().len(), 1);
        assert!(store.claim_earnings(second.id, &ids).await.unwrap().is_empty());
        let first = store.get_payout_request(first.id).await.unwrap().unwrap();
        assert_eq!(first.amount, 1500);
    }

    #[tokio::test]
    async fn failed_payout_releases_earnings() {
        let store = MemoryLedgerStore::new();
        let account = store.ensure_account(Uuid::new_v4()).await.unwrap();
        let earnings = store
            .insert_earnings_once(Uuid::new_v4(), vec![new_earning(&account, "k1", 1500)])
            .await
            .unwrap();
        store.promote_matured_earnings(Utc::now()).await.unwrap();
        let request = store.create_payout_request(account.id, "usd").await.unwrap();
        store
            .claim_earnings(request.id, &[earnings[0].id])
            .await
            .unwrap();

        let failed = store
            .fail_payout_request(request.id, "account_closed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, PayoutStatus::Failed);

        let released = store.earnings_for_account(account.id).await.unwrap();
        assert_eq!(released[0].status, EarningStatus::Payable);
        assert!(released[0].payout_request_id.is_none());

        let covered = store.earnings_for_payout(request.id).await.unwrap();
        assert_eq!(covered.len(), 1);
        assert_eq!(covered[0].id, earnings[0].id);

        // Terminal: a late paid event cannot resurrect the request.
        assert!(store
            .complete_payout_request(request.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stale_capabilities_are_discarded() {
        let store = MemoryLedgerStore::new();
        let account = store.ensure_account(Uuid::new_v4()).await.unwrap();
        let newer = AccountCapabilities {
            status: OnboardingStatus::Active,
            charges_enabled: true,
            payouts_enabled: true,
            observed_at: Utc::now(),
        };
        let older = AccountCapabilities {
            status: OnboardingStatus::Pending,
            charges_enabled: false,
            payouts_enabled: false,
            observed_at: newer.observed_at - chrono::Duration::minutes(5),
        };

        assert!(store
            .apply_account_capabilities(account.id, &newer)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .apply_account_capabilities(account.id, &older)
            .await
            .unwrap()
            .is_none());
        let account = store.find_account_by_creator(account.creator_id).await.unwrap().unwrap();
        assert_eq!(account.onboarding_status, OnboardingStatus::Active);
    }
}
