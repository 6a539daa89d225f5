//! Ledger store - the single source of truth for accounts, escrows, earnings and payouts
//!
//! Every method is atomic with respect to its precondition. State transitions are
//! compare-and-swap updates on the status column: a call that finds the row outside the
//! allowed source states changes nothing and reports `None` (or zero rows), so concurrent
//! service instances resolve races at the store instead of in process memory.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SettlementResult;
use crate::models::{
    Account, AccountCapabilities, Earning, EscrowIntent, EscrowStatus, NewEarning,
    NewEscrowIntent, PayoutRequest, PayoutStatus,
};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ===== Accounts =====

    async fn find_account_by_creator(&self, creator_id: Uuid) -> SettlementResult<Option<Account>>;

    async fn find_account_by_external(
        &self,
        external_account_id: &str,
    ) -> SettlementResult<Option<Account>>;

    /// Return the creator's account, inserting a `NotStarted` one if none exists.
    async fn ensure_account(&self, creator_id: Uuid) -> SettlementResult<Account>;

    /// Record the processor account id and move `NotStarted` to `Pending`.
    /// Returns `None` when another caller attached an id first.
    async fn attach_external_account(
        &self,
        account_id: Uuid,
        external_account_id: &str,
    ) -> SettlementResult<Option<Account>>;

    /// Apply a capability snapshot unless a newer one was already applied.
    async fn apply_account_capabilities(
        &self,
        account_id: Uuid,
        capabilities: &AccountCapabilities,
    ) -> SettlementResult<Option<Account>>;

    async fn deactivate_account(&self, account_id: Uuid) -> SettlementResult<Option<Account>>;

    // ===== Escrow intents =====

    async fn insert_escrow(&self, escrow: NewEscrowIntent) -> SettlementResult<EscrowIntent>;

    async fn get_escrow(&self, id: Uuid) -> SettlementResult<Option<EscrowIntent>>;

    async fn find_escrow_by_external(
        &self,
        external_intent_id: &str,
    ) -> SettlementResult<Option<EscrowIntent>>;

    /// Move the escrow to `to` if its current status is one of `from`.
    async fn transition_escrow(
        &self,
        id: Uuid,
        from: &[EscrowStatus],
        to: EscrowStatus,
        failure_reason: Option<&str>,
    ) -> SettlementResult<Option<EscrowIntent>>;

    // ===== Earnings =====

    /// Insert the whole set unless any earning already exists for the escrow, in which
    /// case the existing set is returned untouched.
    async fn insert_earnings_once(
        &self,
        escrow_intent_id: Uuid,
        earnings: Vec<NewEarning>,
    ) -> SettlementResult<Vec<Earning>>;

    async fn earnings_for_escrow(&self, escrow_intent_id: Uuid) -> SettlementResult<Vec<Earning>>;

    async fn earnings_for_account(&self, account_id: Uuid) -> SettlementResult<Vec<Earning>>;

    /// Every earning the request ever claimed, including after a failure released them.
    async fn earnings_for_payout(&self, payout_request_id: Uuid) -> SettlementResult<Vec<Earning>>;

    /// Promote `Pending` earnings created at or before `cutoff` to `Payable`.
    async fn promote_matured_earnings(&self, cutoff: DateTime<Utc>) -> SettlementResult<u64>;

    /// `Payable` earnings owned by active accounts whose onboarding is `Active`.
    async fn payable_earnings(&self) -> SettlementResult<Vec<Earning>>;

    // ===== Payout requests =====

    async fn create_payout_request(
        &self,
        account_id: Uuid,
        currency: &str,
    ) -> SettlementResult<PayoutRequest>;

    /// Claim each listed earning for the request with a per-row `Payable -> InPayout`
    /// swap; earnings already claimed elsewhere are skipped. The request total is set to
    /// the sum of the claimed rows.
    async fn claim_earnings(
        &self,
        payout_request_id: Uuid,
        earning_ids: &[Uuid],
    ) -> SettlementResult<Vec<Earning>>;

    async fn mark_payout_submitted(
        &self,
        payout_request_id: Uuid,
        external_payout_id: &str,
    ) -> SettlementResult<Option<PayoutRequest>>;

    async fn mark_payout_in_transit(
        &self,
        payout_request_id: Uuid,
    ) -> SettlementResult<Option<PayoutRequest>>;

    /// `Requested | InTransit -> Paid`, cascading covered `InPayout` earnings to `Paid`.
    async fn complete_payout_request(
        &self,
        payout_request_id: Uuid,
    ) -> SettlementResult<Option<PayoutRequest>>;

    /// `Requested | InTransit -> Failed`, releasing covered `InPayout` earnings back to
    /// `Payable`.
    async fn fail_payout_request(
        &self,
        payout_request_id: Uuid,
        reason: &str,
    ) -> SettlementResult<Option<PayoutRequest>>;

    /// `Requested` payout requests with no processor payout id, created at or before
    /// `created_before`, oldest first.
    async fn unsubmitted_payout_requests(
        &self,
        created_before: DateTime<Utc>,
    ) -> SettlementResult<Vec<PayoutRequest>>;

    async fn get_payout_request(&self, id: Uuid) -> SettlementResult<Option<PayoutRequest>>;

    async fn find_payout_by_external(
        &self,
        external_payout_id: &str,
    ) -> SettlementResult<Option<PayoutRequest>>;
}

/// Source states from which a payout request may still be finalized.
pub(crate) const OPEN_PAYOUT_STATES: [PayoutStatus; 2] =
    [PayoutStatus::Requested, PayoutStatus::InTransit];
