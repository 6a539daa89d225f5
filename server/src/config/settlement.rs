use chrono::Duration;

use super::parse_or;
use crate::error::{SettlementError, SettlementResult};

pub const BASIS_POINTS: u32 = 10_000;

#[derive(Clone, Debug)]
pub struct SettlementConfig {
    /// Platform fee taken from every escrow, in basis points.
    pub platform_fee_bps: u32,
    /// Minimum age of a pending earning before it becomes payable.
    pub holding_period: Duration,
    /// A payout group must exceed this total before a payout is requested.
    pub min_payout_amount: i64,
    /// Age after which a payout request with no processor payout id is resubmitted or failed.
    pub unsubmitted_grace_period: Duration,
    pub payout_cron: String,
    pub scheduler_enabled: bool,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: 1_000,
            holding_period: Duration::hours(168),
            min_payout_amount: 1_000,
            unsubmitted_grace_period: Duration::minutes(15),
            payout_cron: "0 */15 * * * *".to_string(),
            scheduler_enabled: true,
        }
    }
}

impl SettlementConfig {
    pub fn from_env() -> SettlementResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> SettlementResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let platform_fee_bps = parse_or(&lookup, "PLATFORM_FEE_BPS", defaults.platform_fee_bps)?;
        if platform_fee_bps > BASIS_POINTS {
            return Err(SettlementError::Configuration(format!(
                "PLATFORM_FEE_BPS must be at most {BASIS_POINTS}, got {platform_fee_bps}"
            )));
        }

        let holding_hours: i64 = parse_or(&lookup, "HOLDING_PERIOD_HOURS", 168)?;
        if holding_hours < 0 {
            return Err(SettlementError::Configuration(
                "HOLDING_PERIOD_HOURS must not be negative".to_string(),
            ));
        }

        let min_payout_amount =
            parse_or(&lookup, "MIN_PAYOUT_AMOUNT", defaults.min_payout_amount)?;
        if min_payout_amount < 0 {
            return Err(SettlementError::Configuration(
                "MIN_PAYOUT_AMOUNT must not be negative".to_string(),
            ));
        }

        let grace_minutes: i64 = parse_or(&lookup, "PAYOUT_RESUBMIT_GRACE_MINUTES", 15)?;
        if grace_minutes < 0 {
            return Err(SettlementError::Configuration(
                "PAYOUT_RESUBMIT_GRACE_MINUTES must not be negative".to_string(),
            ));
        }

        Ok(Self {
            platform_fee_bps,
            holding_period: Duration::hours(holding_hours),
            min_payout_amount,
            unsubmitted_grace_period: Duration::minutes(grace_minutes),
            payout_cron: lookup("PAYOUT_CRON")
                .filter(|cron| !cron.trim().is_empty())
                .unwrap_or(defaults.payout_cron),
            scheduler_enabled: parse_or(
                &lookup,
                "PAYOUT_SCHEDULER_ENABLED",
                defaults.scheduler_enabled,
            )?,
        })
    }
}
