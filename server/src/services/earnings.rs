//! Earnings calculator - splits a settled escrow between the platform and its creators

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::settlement::BASIS_POINTS;
use crate::error::{SettlementError, SettlementResult};
use crate::ledger::LedgerStore;
use crate::models::{Earning, EscrowStatus, NewEarning};

/// Relative share of a campaign attributed to one creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatorWeight {
    pub creator_id: Uuid,
    pub weight: u64,
}

/// Performance weighting policy for a campaign's creators.
#[async_trait]
pub trait CampaignWeighting: Send + Sync {
    async fn creator_weights(&self, campaign_id: Uuid) -> SettlementResult<Vec<CreatorWeight>>;
}

/// Fixed weights per campaign.
#[derive(Default)]
pub struct StaticWeighting {
    campaigns: HashMap<Uuid, Vec<CreatorWeight>>,
}

impl StaticWeighting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_campaign(mut self, campaign_id: Uuid, weights: Vec<CreatorWeight>) -> Self {
        self.campaigns.insert(campaign_id, weights);
        self
    }
}

#[async_trait]
impl CampaignWeighting for StaticWeighting {
    async fn creator_weights(&self, campaign_id: Uuid) -> SettlementResult<Vec<CreatorWeight>> {
        Ok(self.campaigns.get(&campaign_id).cloned().unwrap_or_default())
    }
}

/// Weights creators by the engagement attributed to their campaign content.
pub struct PgContentWeighting {
    db_pool: PgPool,
}

impl PgContentWeighting {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl CampaignWeighting for PgContentWeighting {
    async fn creator_weights(&self, campaign_id: Uuid) -> SettlementResult<Vec<CreatorWeight>> {
        let rows = sqlx::query_as::<_, (Uuid, i64)>(
            r#"
            SELECT creator_id, COALESCE(SUM(engagement), 0)::BIGINT
            FROM campaign_content
            WHERE campaign_id = $1
            GROUP BY creator_id
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, engagement)| *engagement > 0)
            .map(|(creator_id, engagement)| CreatorWeight {
                creator_id,
                weight: engagement as u64,
            })
            .collect())
    }
}

/// Platform fee and per-creator shares of one escrow amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub platform_fee: i64,
    pub distributable: i64,
    pub shares: Vec<(Uuid, i64)>,
}

/// Split `amount` after a `fee_bps` platform fee, proportionally to `weights`.
///
/// Shares are rounded down and the leftover minor units go to the largest fractional
/// remainders (ties broken by creator id), so the shares sum to exactly `distributable`
/// whenever any creator carries weight. Creators whose share rounds to zero are omitted.
pub fn split_amount(amount: i64, fee_bps: u32, weights: &[CreatorWeight]) -> Split {
    let platform_fee = ((amount as i128 * fee_bps as i128) / BASIS_POINTS as i128) as i64;
    let distributable = amount - platform_fee;

    let mut merged: BTreeMap<Uuid, u128> = BTreeMap::new();
    for entry in weights.iter().filter(|entry| entry.weight > 0) {
        *merged.entry(entry.creator_id).or_default() += entry.weight as u128;
    }
    let total_weight: u128 = merged.values().sum();
    if total_weight == 0 || distributable <= 0 {
        return Split {
            platform_fee,
            distributable,
            shares: Vec::new(),
        };
    }

    let pool = distributable as u128;
    let mut shares: Vec<(Uuid, u128, u128)> = merged
        .into_iter()
        .map(|(creator_id, weight)| {
            let exact = pool * weight;
            (creator_id, exact / total_weight, exact % total_weight)
        })
        .collect();

    let allotted: u128 = shares.iter().map(|(_, base, _)| base).sum();
    let leftover = (pool - allotted) as usize;
    let mut order: Vec<usize> = (0..shares.len()).collect();
    order.sort_by(|a, b| {
        shares[*b]
            .2
            .cmp(&shares[*a].2)
            .then_with(|| shares[*a].0.cmp(&shares[*b].0))
    });
    for index in order.into_iter().take(leftover) {
        shares[index].1 += 1;
    }

    Split {
        platform_fee,
        distributable,
        shares: shares
            .into_iter()
            .filter(|(_, share, _)| *share > 0)
            .map(|(creator_id, share, _)| (creator_id, share as i64))
            .collect(),
    }
}

/// Deterministic key guaranteeing at most one earning per (escrow, creator).
pub fn earning_idempotency_key(escrow_intent_id: Uuid, creator_id: Uuid) -> String {
    let digest = Sha256::digest(format!("{escrow_intent_id}:{creator_id}").as_bytes());
    hex::encode(digest)
}

pub struct EarningsCalculator {
    ledger: Arc<dyn LedgerStore>,
    weighting: Arc<dyn CampaignWeighting>,
    platform_fee_bps: u32,
}

impl EarningsCalculator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        weighting: Arc<dyn CampaignWeighting>,
        platform_fee_bps: u32,
    ) -> Self {
        Self {
            ledger,
            weighting,
            platform_fee_bps,
        }
    }

    /// Write the creator earnings for a succeeded escrow, once.
    ///
    /// Calling again after the set exists returns the existing set unchanged, so webhook
    /// redelivery and concurrent invocations are safe.
    pub async fn materialize_earnings(&self, escrow_intent_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let escrow = self
            .ledger
            .get_escrow(escrow_intent_id)
            .await?
            .ok_or(SettlementError::EscrowNotFound)?;
        if escrow.status != EscrowStatus::Succeeded {
            return Err(SettlementError::EscrowNotSettled);
        }

        let existing = self.ledger.earnings_for_escrow(escrow.id).await?;
        if !existing.is_empty() {
            tracing::debug!(%escrow_intent_id, "earnings already materialized");
            return Ok(existing);
        }

        let weights = self.weighting.creator_weights(escrow.campaign_id).await?;
        let split = split_amount(escrow.amount, self.platform_fee_bps, &weights);

        let computed: i64 = split.shares.iter().map(|(_, share)| share).sum();
        if computed > split.distributable || split.shares.iter().any(|(_, share)| *share < 0) {
            tracing::error!(
                %escrow_intent_id,
                computed,
                distributable = split.distributable,
                "earnings split exceeds escrow; manual review required"
            );
            return Err(SettlementError::InsufficientLedgerFunds {
                escrow_intent_id,
                computed,
                distributable: split.distributable,
            });
        }

        if split.shares.is_empty() {
            tracing::warn!(
                %escrow_intent_id,
                campaign_id = %escrow.campaign_id,
                "no weighted creators for campaign; nothing to materialize"
            );
            return Ok(Vec::new());
        }

        let mut new_earnings = Vec::with_capacity(split.shares.len());
        for (creator_id, amount) in &split.shares {
            let account = self.ledger.ensure_account(*creator_id).await?;
            new_earnings.push(NewEarning {
                account_id: account.id,
                creator_id: *creator_id,
                amount: *amount,
                currency: escrow.currency.clone(),
                idempotency_key: earning_idempotency_key(escrow.id, *creator_id),
            });
        }

        let earnings = self
            .ledger
            .insert_earnings_once(escrow.id, new_earnings)
            .await?;

        tracing::info!(
            %escrow_intent_id,
            platform_fee = split.platform_fee,
            distributed = computed,
            creators = earnings.len(),
            "earnings materialized"
        );

        Ok(earnings)
    }

    pub async fn earnings_for_escrow(&self, escrow_intent_id: Uuid) -> SettlementResult<Vec<Earning>> {
        self.ledger
            .get_escrow(escrow_intent_id)
            .await?
            .ok_or(SettlementError::EscrowNotFound)?;
        self.ledger.earnings_for_escrow(escrow_intent_id).await
    }

    pub async fn earnings_for_creator(&self, creator_id: Uuid) -> SettlementResult<Vec<Earning>> {
        let account = self
            .ledger
            .find_account_by_creator(creator_id)
            .await?
            .ok_or(SettlementError::AccountNotFound)?;
        self.ledger.earnings_for_account(account.id).await
    }
}
