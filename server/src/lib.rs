//! Creator Settlement Backend Library
//!
//! Settlement core for a creator marketplace: processor onboarding, brand payment escrow,
//! earnings attribution, webhook reconciliation and scheduled payouts.

pub mod app_state;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod routes;
pub mod services;
