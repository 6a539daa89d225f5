//! Route definitions for the settlement API

use axum::{
    routing::{get, post},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::{onboarding, payments, payouts, webhook};

// Creator onboarding and earnings routes
pub fn creator_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/creators/:creator_id/onboarding",
            post(onboarding::start_onboarding).get(onboarding::get_onboarding_status),
        )
        .route(
            "/api/creators/:creator_id/onboarding/link",
            post(onboarding::create_account_link),
        )
        .route(
            "/api/creators/:creator_id/deactivate",
            post(onboarding::deactivate_account),
        )
        .route(
            "/api/creators/:creator_id/earnings",
            get(onboarding::list_creator_earnings),
        )
}

// Escrow routes
pub fn escrow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/escrows", post(payments::create_escrow))
        .route("/api/escrows/:id", get(payments::get_escrow))
        .route("/api/escrows/:id/earnings", get(payments::list_escrow_earnings))
}

// Payout routes
pub fn payout_routes() -> Router<AppState> {
    Router::new().route("/api/payouts/run", post(payouts::run_payout_cycle))
}

// Processor webhook routes
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/api/webhooks/processor", post(webhook::processor_webhook))
}

/// Every API route with state applied, without transport layers.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(crate::handlers::root))
        .route("/health", get(crate::handlers::health_check))
        .merge(creator_routes())
        .merge(escrow_routes())
        .merge(payout_routes())
        .merge(webhook_routes())
        .with_state(state)
}
