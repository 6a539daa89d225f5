//! Creator Settlement Server
//!
//! HTTP surface for creator onboarding, brand escrow intake, processor webhooks and
//! payout runs, backed by Postgres (or an in-process ledger when no database is set).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{header, HeaderName, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use creatorpay_server::app_state::AppState;
use creatorpay_server::config::{ProcessorConfig, ServerConfig, SettlementConfig};
use creatorpay_server::gateway::HttpProcessorGateway;
use creatorpay_server::ledger::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use creatorpay_server::routes;
use creatorpay_server::services::{
    CampaignWeighting, PayoutScheduler, PgContentWeighting, StaticWeighting,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,creatorpay_server=debug,sqlx=warn")),
        )
        .init();

    let server_config = ServerConfig::from_env().context("loading server configuration")?;
    let settlement_config =
        SettlementConfig::from_env().context("loading settlement configuration")?;
    let processor_config =
        ProcessorConfig::from_env().context("loading processor configuration")?;

    let (ledger, weighting): (Arc<dyn LedgerStore>, Arc<dyn CampaignWeighting>) =
        match &server_config.database_url {
            Some(database_url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(server_config.database_max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(database_url)
                    .await
                    .context("connecting to the database")?;
                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context("running database migrations")?;
                info!("connected to Postgres ledger");
                (
                    Arc::new(PgLedgerStore::new(pool.clone())),
                    Arc::new(PgContentWeighting::new(pool)),
                )
            }
            None => {
                warn!("DATABASE_URL not set; using the in-memory ledger (state is lost on restart)");
                (
                    Arc::new(MemoryLedgerStore::new()),
                    Arc::new(StaticWeighting::new()),
                )
            }
        };

    let gateway = Arc::new(
        HttpProcessorGateway::new(processor_config).context("building processor client")?,
    );

    let scheduler_enabled = settlement_config.scheduler_enabled;
    let payout_cron = settlement_config.payout_cron.clone();
    let state = AppState::new(ledger, gateway, weighting, settlement_config);

    let scheduler = if scheduler_enabled {
        Some(
            PayoutScheduler::start(state.dispatcher.clone(), &payout_cron)
                .await
                .context("starting payout scheduler")?,
        )
    } else {
        info!("payout scheduler disabled");
        None
    };

    let app = routes::api_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&server_config.cors_allowed_origins));

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));
    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await.context("stopping payout scheduler")?;
    }
    info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allowed_origins = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("processor-signature"),
        ])
        .allow_credentials(false)
}
