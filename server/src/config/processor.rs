use std::time::Duration;

use super::{parse_or, required};
use crate::error::SettlementResult;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub api_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub timeout: Duration,
    pub webhook_tolerance_seconds: i64,
    pub onboarding_refresh_url: String,
    pub onboarding_return_url: String,
}

impl ProcessorConfig {
    pub fn from_env() -> SettlementResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> SettlementResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let timeout_seconds: u64 = parse_or(&lookup, "PROCESSOR_TIMEOUT_SECONDS", 10)?;

        Ok(Self {
            api_url: lookup("PROCESSOR_API_URL")
                .filter(|url| !url.trim().is_empty())
                .unwrap_or_else(|| "https://api.stripe.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            secret_key: required(&lookup, "PROCESSOR_SECRET_KEY")?,
            // Fail closed: webhooks cannot be accepted without a signing secret.
            webhook_secret: required(&lookup, "PROCESSOR_WEBHOOK_SECRET")?,
            timeout: Duration::from_secs(timeout_seconds),
            webhook_tolerance_seconds: parse_or(&lookup, "WEBHOOK_TOLERANCE_SECONDS", 300)?,
            onboarding_refresh_url: lookup("ONBOARDING_REFRESH_URL")
                .unwrap_or_else(|| "http://localhost:3000/onboarding/refresh".to_string()),
            onboarding_return_url: lookup("ONBOARDING_RETURN_URL")
                .unwrap_or_else(|| "http://localhost:3000/onboarding/complete".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SettlementError;

    #[test]
    fn webhook_secret_is_required() {
        let err = ProcessorConfig::from_vars(|key| {
            (key == "PROCESSOR_SECRET_KEY").then(|| "sk_test".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, SettlementError::Configuration(msg) if msg.contains("PROCESSOR_WEBHOOK_SECRET")));
    }

    #[test]
    fn trims_trailing_slash_from_api_url() {
        let config = ProcessorConfig::from_vars(|key| match key {
            "PROCESSOR_SECRET_KEY" => Some("sk_test".to_string()),
            "PROCESSOR_WEBHOOK_SECRET" => Some("whsec_test".to_string()),
            "PROCESSOR_API_URL" => Some("http://localhost:12111/".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.api_url, "http://localhost:12111");
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.webhook_tolerance_seconds, 300);
    }
}
