//! stream_ledger maintenance runner
//!
//! Connects to the event store database, verifies the schema and runs one
//! maintenance pass. Meant to be invoked by an external scheduler.

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_ledger::jobs::{MaintenanceConfig, MaintenanceJobs};
use stream_ledger::{db, Config, EventStore, EventTypeRegistry, PostgresStorage};

/// Initialize tracing/logging
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stream_ledger=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env()?;

    tracing::info!(environment = %config.environment, "Starting stream_ledger maintenance");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    db::verify_connection(&pool).await?;
    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    // maintenance never decodes payloads, so no event types are registered
    let store = EventStore::new(
        PostgresStorage::new(pool.clone()),
        EventTypeRegistry::new(),
        config.event_store_config(),
    );

    let report = MaintenanceJobs::with_config(store, MaintenanceConfig::from(&config))
        .run_all_once()
        .await;

    for error in &report.errors {
        tracing::error!(error = %error, "Maintenance job failed");
    }
    tracing::info!(
        orphaned_commands_deleted = report.orphaned_commands_deleted,
        snapshot_candidates = report.snapshot_candidates.len(),
        completed_at = %report.completed_at,
        "Maintenance pass finished"
    );

    pool.close().await;

    if !report.is_success() {
        return Err(anyhow::anyhow!("{} maintenance job(s) failed", report.errors.len()));
    }
    Ok(())
}
