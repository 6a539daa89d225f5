//! Payout dispatcher - batches payable earnings into processor payouts

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::config::settlement::SettlementConfig;
use crate::error::{SettlementError, SettlementResult};
use crate::gateway::ProcessorGateway;
use crate::ledger::LedgerStore;
use crate::models::{Earning, EarningStatus, OnboardingStatus, PayoutRequest};

const CONTESTED_CLAIM_REASON: &str = "claim contested by a concurrent payout cycle";
const UNSUBMITTED_REASON: &str = "payout request was never submitted to the processor";

/// Summary of one payout cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutCycleReport {
    pub promoted: u64,
    pub earnings_claimed: usize,
    pub requests_submitted: usize,
    pub requests_failed: usize,
    pub groups_below_threshold: usize,
    pub groups_contested: usize,
    /// Unsubmitted requests from earlier cycles that were resubmitted or failed.
    pub requests_recovered: usize,
}

pub struct PayoutDispatcher {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn ProcessorGateway>,
    config: SettlementConfig,
    running: AtomicBool,
}

struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PayoutDispatcher {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn ProcessorGateway>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Run a cycle unless one is already in progress on this instance.
    pub async fn try_run_cycle(&self) -> SettlementResult<Option<PayoutCycleReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("payout cycle already running");
            return Ok(None);
        }
        let _guard = CycleGuard(&self.running);

        self.run_payout_cycle().await.map(Some)
    }

    /// Settle requests earlier cycles left unsubmitted, promote matured earnings, then request
    /// one payout per (account, currency) group whose payable total exceeds the configured
    /// minimum.
    ///
    /// Safe to run concurrently with other cycles, including on other instances: earnings are
    /// claimed row by row at the store and a cycle only pays out what it claimed.
    pub async fn run_payout_cycle(&self) -> SettlementResult<PayoutCycleReport> {
        let mut report = PayoutCycleReport::default();

        self.recover_unsubmitted(&mut report).await?;

        let cutoff = Utc::now() - self.config.holding_period;
        report.promoted = self.ledger.promote_matured_earnings(cutoff).await?;

        let mut groups: BTreeMap<(Uuid, String), Vec<Earning>> = BTreeMap::new();
        for earning in self.ledger.payable_earnings().await? {
            groups
                .entry((earning.account_id, earning.currency.clone()))
                .or_default()
                .push(earning);
        }

        for ((account_id, currency), earnings) in groups {
            let total: i64 = earnings.iter().map(|earning| earning.amount).sum();
            if total <= self.config.min_payout_amount {
                tracing::debug!(
                    %account_id,
                    %currency,
                    total,
                    minimum = self.config.min_payout_amount,
                    "payable total below payout threshold"
                );
                report.groups_below_threshold += 1;
                continue;
            }

            self.dispatch_group(account_id, &currency, &earnings, &mut report)
                .await?;
        }

        tracing::info!(
            promoted = report.promoted,
            submitted = report.requests_submitted,
            failed = report.requests_failed,
            below_threshold = report.groups_below_threshold,
            contested = report.groups_contested,
            recovered = report.requests_recovered,
            "payout cycle finished"
        );

        Ok(report)
    }

    async fn dispatch_group(
        &self,
        account_id: Uuid,
        currency: &str,
        earnings: &[Earning],
        report: &mut PayoutCycleReport,
    ) -> SettlementResult<()> {
        // Every earning in the group belongs to the same account.
        let Some(creator_id) = earnings.first().map(|earning| earning.creator_id) else {
            return Ok(());
        };
        let Some(external_account_id) = self.payout_destination(creator_id).await? else {
            tracing::warn!(%account_id, "active account has no processor account; skipping");
            return Ok(());
        };

        let request = self.ledger.create_payout_request(account_id, currency).await?;
        let ids: Vec<Uuid> = earnings.iter().map(|earning| earning.id).collect();
        let claimed = self.ledger.claim_earnings(request.id, &ids).await?;
        let amount: i64 = claimed.iter().map(|earning| earning.amount).sum();

        if amount <= self.config.min_payout_amount {
            self.ledger
                .fail_payout_request(request.id, CONTESTED_CLAIM_REASON)
                .await?;
            tracing::info!(
                payout_request_id = %request.id,
                claimed = claimed.len(),
                amount,
                "payout group contested; claim released"
            );
            report.groups_contested += 1;
            return Ok(());
        }

        self.submit(&request, &external_account_id, &claimed, report)
            .await
    }

    /// Resubmit or fail `Requested` requests that never got a processor payout id, so their
    /// earnings do not stay `InPayout`. Resubmission reuses the request id, which the processor
    /// deduplicates on.
    async fn recover_unsubmitted(&self, report: &mut PayoutCycleReport) -> SettlementResult<()> {
        let cutoff = Utc::now() - self.config.unsubmitted_grace_period;
        for request in self.ledger.unsubmitted_payout_requests(cutoff).await? {
            let claimed: Vec<Earning> = self
                .ledger
                .earnings_for_payout(request.id)
                .await?
                .into_iter()
                .filter(|earning| {
                    earning.status == EarningStatus::InPayout
                        && earning.payout_request_id == Some(request.id)
                })
                .collect();
            let amount: i64 = claimed.iter().map(|earning| earning.amount).sum();
            report.requests_recovered += 1;

            let destination = match claimed.first() {
                Some(earning) if amount > self.config.min_payout_amount => {
                    self.payout_destination(earning.creator_id).await?
                }
                _ => None,
            };
            let Some(external_account_id) = destination else {
                self.ledger
                    .fail_payout_request(request.id, UNSUBMITTED_REASON)
                    .await?;
                tracing::warn!(
                    payout_request_id = %request.id,
                    account_id = %request.account_id,
                    earnings = claimed.len(),
                    amount,
                    "unsubmitted payout request failed; earnings released"
                );
                report.requests_failed += 1;
                continue;
            };

            tracing::info!(
                payout_request_id = %request.id,
                created_at = %request.created_at,
                "resubmitting unsubmitted payout request"
            );
            self.submit(&request, &external_account_id, &claimed, report)
                .await?;
        }

        Ok(())
    }

    async fn submit(
        &self,
        request: &PayoutRequest,
        external_account_id: &str,
        claimed: &[Earning],
        report: &mut PayoutCycleReport,
    ) -> SettlementResult<()> {
        let amount: i64 = claimed.iter().map(|earning| earning.amount).sum();
        match self
            .gateway
            .create_payout(request.id, external_account_id, amount, &request.currency)
            .await
        {
            Ok(external_payout_id) => {
                self.ledger
                    .mark_payout_submitted(request.id, &external_payout_id)
                    .await?;
                tracing::info!(
                    payout_request_id = %request.id,
                    account_id = %request.account_id,
                    %external_payout_id,
                    amount,
                    currency = %request.currency,
                    earnings = claimed.len(),
                    "payout requested"
                );
                report.requests_submitted += 1;
                report.earnings_claimed += claimed.len();
            }
            Err(err) => {
                tracing::warn!(
                    payout_request_id = %request.id,
                    account_id = %request.account_id,
                    amount,
                    error = %err,
                    "payout request rejected; earnings released"
                );
                self.ledger
                    .fail_payout_request(request.id, &err.to_string())
                    .await?;
                report.requests_failed += 1;
            }
        }

        Ok(())
    }

    /// Processor account of an active, fully onboarded creator.
    async fn payout_destination(&self, creator_id: Uuid) -> SettlementResult<Option<String>> {
        Ok(self
            .ledger
            .find_account_by_creator(creator_id)
            .await?
            .filter(|account| {
                account.active && account.onboarding_status == OnboardingStatus::Active
            })
            .and_then(|account| account.external_account_id))
    }
}

/// Cron-driven trigger for payout cycles.
pub struct PayoutScheduler {
    scheduler: JobScheduler,
}

impl PayoutScheduler {
    pub async fn start(dispatcher: Arc<PayoutDispatcher>, cron: &str) -> SettlementResult<Self> {
        let job = Job::new_async(cron, move |_job_id, _scheduler| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                match dispatcher.try_run_cycle().await {
                    Ok(Some(_)) => {}
                    Ok(None) => tracing::info!("previous payout cycle still running; tick skipped"),
                    Err(err) => tracing::error!(error = %err, "scheduled payout cycle failed"),
                }
            })
        })
        .map_err(|err| {
            SettlementError::Configuration(format!("invalid payout cron '{cron}': {err:?}"))
        })?;

        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        scheduler.add(job).await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;
        tracing::info!(%cron, "payout scheduler started");

        Ok(Self { scheduler })
    }

    pub async fn shutdown(mut self) -> SettlementResult<()> {
        self.scheduler.shutdown().await.map_err(scheduler_error)
    }
}

fn scheduler_error<E: std::fmt::Debug>(err: E) -> SettlementError {
    SettlementError::Configuration(format!("payout scheduler: {err:?}"))
}
