//! Postgres-backed ledger store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{LedgerStore, OPEN_PAYOUT_STATES};
use crate::error::{SettlementError, SettlementResult};
use crate::models::{
    Account, AccountCapabilities, Earning, EarningStatus, EscrowIntent, EscrowStatus,
    NewEarning, NewEscrowIntent, OnboardingStatus, PayoutRequest, PayoutStatus,
};

const UNIQUE_VIOLATION: &str = "23505";

pub struct PgLedgerStore {
    db_pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    // ===== Accounts =====

    async fn find_account_by_creator(&self, creator_id: Uuid) -> SettlementResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE creator_id = $1")
            .bind(creator_id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(account)
    }

    async fn find_account_by_external(
        &self,
        external_account_id: &str,
    ) -> SettlementResult<Option<Account>> {
        let account =
            sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE external_account_id = $1")
                .bind(external_account_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(account)
    }

    async fn ensure_account(&self, creator_id: Uuid) -> SettlementResult<Account> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, creator_id, onboarding_status, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (creator_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(creator_id)
        .bind(OnboardingStatus::NotStarted)
        .execute(&self.db_pool)
        .await?;

        let account = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE creator_id = $1")
            .bind(creator_id)
            .fetch_one(&self.db_pool)
            .await?;

        Ok(account)
    }

    async fn attach_external_account(
        &self,
        account_id: Uuid,
        external_account_id: &str,
    ) -> SettlementResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
            SET external_account_id = $2, onboarding_status = $3, updated_at = NOW()
            WHERE id = $1
              AND external_account_id IS NULL
              AND onboarding_status = $4
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(external_account_id)
        .bind(OnboardingStatus::Pending)
        .bind(OnboardingStatus::NotStarted)
        .fetch_optional(&self.db_pool)
        .await
        .map_err(|err| {
            unique_conflict(err, || {
                format!("external account {external_account_id} is attached to another creator")
            })
        })?;

        Ok(account)
    }

    async fn apply_account_capabilities(
        &self,
        account_id: Uuid,
        capabilities: &AccountCapabilities,
    ) -> SettlementResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            UPDATE accounts
            SET onboarding_status = $2,
                charges_enabled = $3,
                payouts_enabled = $4,
                status_observed_at = $5,
                updated_at = NOW()
            WHERE id = $1
              AND (status_observed_at IS NULL OR status_observed_at <= $5)
            RETURNING *
            "#,
        )
        .bind(account_id)
        .bind(capabilities.status)
        .bind(capabilities.charges_enabled)
        .bind(capabilities.payouts_enabled)
        .bind(capabilities.observed_at)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(account)
    }

    async fn deactivate_account(&self, account_id: Uuid) -> SettlementResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "UPDATE accounts SET active = FALSE, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(account_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(account)
    }

    // ===== Escrow intents =====

    async fn insert_escrow(&self, escrow: NewEscrowIntent) -> SettlementResult<EscrowIntent> {
        let escrow = sqlx::query_as::<_, EscrowIntent>(
            r#"
            INSERT INTO escrow_intents (
                id, campaign_id, brand_id, amount, currency, external_intent_id,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(escrow.id)
        .bind(escrow.campaign_id)
        .bind(escrow.brand_id)
        .bind(escrow.amount)
        .bind(escrow.currency)
        .bind(&escrow.external_intent_id)
        .bind(EscrowStatus::Created)
        .fetch_one(&self.db_pool)
        .await
        .map_err(|err| {
            unique_conflict(err, || {
                format!("escrow intent {} already recorded", escrow.external_intent_id)
            })
        })?;

        Ok(escrow)
    }

    async fn get_escrow(&self, id: Uuid) -> SettlementResult<Option<EscrowIntent>> {
        let escrow = sqlx::query_as::<_, EscrowIntent>("SELECT * FROM escrow_intents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(escrow)
    }

    async fn find_escrow_by_external(
        &self,
        external_intent_id: &str,
    ) -> SettlementResult<Option<EscrowIntent>> {
        let escrow = sqlx::query_as::<_, EscrowIntent>(
            "SELECT * FROM escrow_intents WHERE external_intent_id = $1",
        )
        .bind(external_intent_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(escrow)
    }

    async fn transition_escrow(
        &self,
        id: Uuid,
        from: &[EscrowStatus],
        to: EscrowStatus,
        failure_reason: Option<&str>,
    ) -> SettlementResult<Option<EscrowIntent>> {
        let escrow = sqlx::query_as::<_, EscrowIntent>(
            r#"
            UPDATE escrow_intents
            SET status = $3,
                failure_reason = COALESCE($4, failure_reason),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.to_vec())
        .bind(to)
        .bind(failure_reason)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(escrow)
    }

    // ===== Earnings =====

    async fn insert_earnings_once(
        &self,
        escrow_intent_id: Uuid,
        earnings: Vec<NewEarning>,
    ) -> SettlementResult<Vec<Earning>> {
        let mut tx = self.db_pool.begin().await?;

        // Serializes concurrent materializations of the same escrow on its row lock.
        sqlx::query("SELECT id FROM escrow_intents WHERE id = $1 FOR UPDATE")
            .bind(escrow_intent_id)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, Earning>(
            "SELECT * FROM earnings WHERE escrow_intent_id = $1 ORDER BY created_at, id",
        )
        .bind(escrow_intent_id)
        .fetch_all(&mut *tx)
        .await?;
        if !existing.is_empty() {
            tx.commit().await?;
            return Ok(existing);
        }

        for earning in earnings {
            sqlx::query(
                r#"
                INSERT INTO earnings (
                    id, account_id, creator_id, escrow_intent_id, amount, currency,
                    status, idempotency_key, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
                ON CONFLICT (idempotency_key) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(earning.account_id)
            .bind(earning.creator_id)
            .bind(escrow_intent_id)
            .bind(earning.amount)
            .bind(earning.currency)
            .bind(EarningStatus::Pending)
            .bind(earning.idempotency_key)
            .execute(&mut *tx)
            .await?;
        }

        let inserted = sqlx::query_as::<_, Earning>(
            "SELECT * FROM earnings WHERE escrow_intent_id = $1 ORDER BY created_at, id",
        )
        .bind(escrow_intent_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted)
    }

    async fn earnings_for_escrow(&self, escrow_intent_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let earnings = sqlx::query_as::<_, Earning>(
            "SELECT * FROM earnings WHERE escrow_intent_id = $1 ORDER BY created_at, id",
        )
        .bind(escrow_intent_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(earnings)
    }

    async fn earnings_for_account(&self, account_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let earnings = sqlx::query_as::<_, Earning>(
            "SELECT * FROM earnings WHERE account_id = $1 ORDER BY created_at DESC, id",
        )
        .bind(account_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(earnings)
    }

    async fn earnings_for_payout(&self, payout_request_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let earnings = sqlx::query_as::<_, Earning>(
            r#"
            SELECT e.*
            FROM earnings e
            JOIN payout_request_earnings c ON c.earning_id = e.id
            WHERE c.payout_request_id = $1
            ORDER BY e.created_at, e.id
            "#,
        )
        .bind(payout_request_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(earnings)
    }

    async fn promote_matured_earnings(&self, cutoff: DateTime<Utc>) -> SettlementResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE earnings
            SET status = $1, updated_at = NOW()
            WHERE status = $2 AND created_at <= $3
            "#,
        )
        .bind(EarningStatus::Payable)
        .bind(EarningStatus::Pending)
        .bind(cutoff)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn payable_earnings(&self) -> SettlementResult<Vec<Earning>> {
        let earnings = sqlx::query_as::<_, Earning>(
            r#"
            SELECT e.*
            FROM earnings e
            JOIN accounts a ON a.id = e.account_id
            WHERE e.status = $1
              AND a.active
              AND a.onboarding_status = $2
            ORDER BY e.account_id, e.created_at, e.id
            "#,
        )
        .bind(EarningStatus::Payable)
        .bind(OnboardingStatus::Active)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(earnings)
    }

    // ===== Payout requests =====

    async fn create_payout_request(
        &self,
        account_id: Uuid,
        currency: &str,
    ) -> SettlementResult<PayoutRequest> {
        let request = sqlx::query_as::<_, PayoutRequest>(
            r#"
            INSERT INTO payout_requests (id, account_id, amount, currency, status, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $4, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(account_id)
        .bind(currency)
        .bind(PayoutStatus::Requested)
        .fetch_one(&self.db_pool)
        .await?;

        Ok(request)
    }

    async fn claim_earnings(
        &self,
        payout_request_id: Uuid,
        earning_ids: &[Uuid],
    ) -> SettlementResult<Vec<Earning>> {
        let mut tx = self.db_pool.begin().await?;

        let request = sqlx::query_as::<_, PayoutRequest>(
            "SELECT * FROM payout_requests WHERE id = $1 AND status = $2 FOR UPDATE",
        )
        .bind(payout_request_id)
        .bind(PayoutStatus::Requested)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(request) = request else {
            tx.commit().await?;
            return Ok(Vec::new());
        };

        let claimed = sqlx::query_as::<_, Earning>(
            r#"
            UPDATE earnings
            SET status = $1, payout_request_id = $2, updated_at = NOW()
            WHERE id = ANY($3)
              AND status = $4
              AND account_id = $5
              AND currency = $6
            RETURNING *
            "#,
        )
        .bind(EarningStatus::InPayout)
        .bind(payout_request_id)
        .bind(earning_ids.to_vec())
        .bind(EarningStatus::Payable)
        .bind(request.account_id)
        .bind(&request.currency)
        .fetch_all(&mut *tx)
        .await?;

        let claimed_ids: Vec<Uuid> = claimed.iter().map(|earning| earning.id).collect();
        sqlx::query(
            r#"
            INSERT INTO payout_request_earnings (payout_request_id, earning_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(payout_request_id)
        .bind(claimed_ids)
        .execute(&mut *tx)
        .await?;

        let total: i64 = claimed.iter().map(|earning| earning.amount).sum();
        sqlx::query("UPDATE payout_requests SET amount = $2, updated_at = NOW() WHERE id = $1")
            .bind(payout_request_id)
            .bind(total)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_payout_submitted(
        &self,
        payout_request_id: Uuid,
        external_payout_id: &str,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let request = sqlx::query_as::<_, PayoutRequest>(
            r#"
            UPDATE payout_requests
            SET external_payout_id = $2, updated_at = NOW()
            WHERE id = $1 AND external_payout_id IS NULL
            RETURNING *
            "#,
        )
        .bind(payout_request_id)
        .bind(external_payout_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(request)
    }

    async fn mark_payout_in_transit(
        &self,
        payout_request_id: Uuid,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let request = sqlx::query_as::<_, PayoutRequest>(
            r#"
            UPDATE payout_requests
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = $3
            RETURNING *
            "#,
        )
        .bind(payout_request_id)
        .bind(PayoutStatus::InTransit)
        .bind(PayoutStatus::Requested)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(request)
    }

    async fn complete_payout_request(
        &self,
        payout_request_id: Uuid,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let mut tx = self.db_pool.begin().await?;

        let request = sqlx::query_as::<_, PayoutRequest>(
            r#"
            UPDATE payout_requests
            SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING *
            "#,
        )
        .bind(payout_request_id)
        .bind(PayoutStatus::Paid)
        .bind(OPEN_PAYOUT_STATES.to_vec())
        .fetch_optional(&mut *tx)
        .await?;

        if request.is_some() {
            sqlx::query(
                r#"
                UPDATE earnings
                SET status = $2, updated_at = NOW()
                WHERE payout_request_id = $1 AND status = $3
                "#,
            )
            .bind(payout_request_id)
            .bind(EarningStatus::Paid)
            .bind(EarningStatus::InPayout)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(request)
    }

    async fn fail_payout_request(
        &self,
        payout_request_id: Uuid,
        reason: &str,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let mut tx = self.db_pool.begin().await?;

        let request = sqlx::query_as::<_, PayoutRequest>(
            r#"
            UPDATE payout_requests
            SET status = $2, failure_reason = $3, updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(payout_request_id)
        .bind(PayoutStatus::Failed)
        .bind(reason)
        .bind(OPEN_PAYOUT_STATES.to_vec())
        .fetch_optional(&mut *tx)
        .await?;

        if request.is_some() {
            sqlx::query(
                r#"
                UPDATE earnings
                SET status = $2, payout_request_id = NULL, updated_at = NOW()
                WHERE payout_request_id = $1 AND status = $3
                "#,
            )
            .bind(payout_request_id)
            .bind(EarningStatus::Payable)
            .bind(EarningStatus::InPayout)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(request)
    }

    async fn unsubmitted_payout_requests(
        &self,
        created_before: DateTime<Utc>,
    ) -> SettlementResult<Vec<PayoutRequest>> {
        let requests = sqlx::query_as::<_, PayoutRequest>(
            r#"
            SELECT * FROM payout_requests
            WHERE status = $1
              AND external_payout_id IS NULL
              AND created_at <= $2
            ORDER BY created_at, id
            "#,
        )
        .bind(PayoutStatus::Requested)
        .bind(created_before)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(requests)
    }

    async fn get_payout_request(&self, id: Uuid) -> SettlementResult<Option<PayoutRequest>> {
        let request =
            sqlx::query_as::<_, PayoutRequest>("SELECT * FROM payout_requests WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(request)
    }

    async fn find_payout_by_external(
        &self,
        external_payout_id: &str,
    ) -> SettlementResult<Option<PayoutRequest>> {
        let request = sqlx::query_as::<_, PayoutRequest>(
            "SELECT * FROM payout_requests WHERE external_payout_id = $1",
        )
        .bind(external_payout_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(request)
    }
}

/// Report a unique-key violation as a conflict, matching the in-memory store.
fn unique_conflict(err: sqlx::Error, describe: impl FnOnce() -> String) -> SettlementError {
    let duplicate = matches!(
        &err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION)
    );
    if duplicate {
        SettlementError::ConflictingState(describe())
    } else {
        SettlementError::Storage(err)
    }
}
