//! Environment-driven configuration

pub mod processor;
pub mod settlement;

use std::str::FromStr;

use crate::error::{SettlementError, SettlementResult};

pub use processor::ProcessorConfig;
pub use settlement::SettlementConfig;

/// Server-level settings outside the settlement core
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub cors_allowed_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> SettlementResult<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> SettlementResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            port: parse_or(&lookup, "PORT", 3001)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            cors_allowed_origins: lookup("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
        })
    }
}

/// Parse an optional variable, falling back to `default` when unset or blank.
pub(crate) fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> SettlementResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            SettlementError::Configuration(format!("{key} has an invalid value: {raw}"))
        }),
        _ => Ok(default),
    }
}

pub(crate) fn required<F>(lookup: &F, key: &str) -> SettlementResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| SettlementError::Configuration(format!("{key} must be set")))
}
