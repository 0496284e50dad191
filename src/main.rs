//! Herald outbound webhook delivery service.
//!
//! Wires the retry store, delivery client, dispatcher and drain scheduler
//! together and serves the HTTP API until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{config::DEFAULT_LOG_FILTER, middleware::auth::OperatorSecret, AppState, Config};
use herald_core::{storage::Storage, Clock, RealClock};
use herald_delivery::{
    DeliveryClient, DeliveryStorage, Dispatcher, DrainScheduler, PayloadFormatter,
    PostgresDeliveryStorage,
};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        max_attempts = config.max_delivery_attempts,
        drain_budget_secs = config.drain_budget_secs,
        operator_secret_configured = config.has_operator_secret(),
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.ensure_schema().await.context("Failed to create database schema")?;
    info!("Database schema ready");

    let state = build_state(&config, storage)?;
    let addr = config.parse_server_addr()?;

    herald_api::start_server(state, addr).await.context("Server failed")?;

    db_pool.close().await;
    info!("Herald shutdown complete");
    Ok(())
}

/// Builds the shared handler state from configuration.
fn build_state(config: &Config, storage: Arc<Storage>) -> Result<AppState> {
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let delivery_storage: Arc<dyn DeliveryStorage> = Arc::new(PostgresDeliveryStorage::new(storage));
    let client = Arc::new(
        DeliveryClient::new(config.to_client_config()).context("Failed to build HTTP client")?,
    );
    let formatter = PayloadFormatter::new(config.to_formatter_config());
    let policy = config.to_retry_policy();
    policy.validate().context("Invalid retry policy")?;

    let dispatcher = Dispatcher::new(
        delivery_storage.clone(),
        client.clone(),
        formatter.clone(),
        policy.clone(),
        clock.clone(),
    );
    let scheduler = DrainScheduler::new(
        delivery_storage.clone(),
        client,
        formatter,
        policy,
        clock.clone(),
        config.to_drain_config(),
    )
    .context("Invalid drain configuration")?;

    Ok(AppState {
        storage: delivery_storage,
        dispatcher: Arc::new(dispatcher),
        scheduler: Arc::new(scheduler),
        clock,
        operator_secret: OperatorSecret::new(config.operator_secret.as_deref()),
        drain_budget: config.drain_budget(),
        drain_hard_timeout: config.drain_hard_timeout(),
        request_timeout: config.request_timeout(),
    })
}

/// Initializes tracing from the configured filter.
fn init_tracing(filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(filter)
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
