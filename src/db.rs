//! Database module
//!
//! Connection and schema checks. Tables are created from the raw SQL files
//! in `migrations/`.

use sqlx::{Executor, PgPool};

const EVENT_STORE_SCHEMA: &str = include_str!("../migrations/0001_event_store.sql");

/// Tables the Postgres event storage reads and writes
pub const REQUIRED_TABLES: [&str; 4] = ["event_streams", "commands", "events", "snapshot_events"];

/// Verify database connectivity
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;

    Ok(())
}

/// Apply the event store schema. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    pool.execute(EVENT_STORE_SCHEMA).await?;
    tracing::info!("Event store schema applied");

    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!(table, "Required table does not exist");
            return Ok(false);
        }
    }

    tracing::info!("Event store schema verified");
    Ok(true)
}
