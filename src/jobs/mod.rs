//! Maintenance Jobs
//!
//! One-shot maintenance tasks over the event store: orphaned command cleanup
//! and snapshot candidate discovery. Scheduling them is left to the caller.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::event_store::{EventStorage, EventStore, EventStoreError};

/// Delete commands whose events are all gone
pub async fn purge_orphaned_commands<S: EventStorage>(
    store: &EventStore<S>,
    aggregate_id: Option<Uuid>,
) -> Result<u64, JobError> {
    let rows_deleted = store
        .permanently_delete_commands_without_events(aggregate_id)
        .await?;

    if rows_deleted > 0 {
        tracing::info!(rows_deleted = rows_deleted, "Purged orphaned commands");
    }

    Ok(rows_deleted)
}

/// Find aggregates that should get a fresh snapshot
pub async fn find_snapshot_candidates<S: EventStorage>(
    store: &EventStore<S>,
    aggregate_type: Option<&str>,
    limit: usize,
) -> Result<Vec<Uuid>, JobError> {
    let candidates = store.aggregates_that_need_snapshots(aggregate_type, limit).await?;

    if !candidates.is_empty() {
        tracing::info!(
            candidates = candidates.len(),
            aggregate_type = aggregate_type.unwrap_or("*"),
            "Aggregates need snapshots"
        );
    }

    Ok(candidates)
}

/// Configuration for a maintenance pass
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Restrict snapshot candidates to one aggregate type
    pub snapshot_aggregate_type: Option<String>,
    /// Maximum snapshot candidates reported (default: 100)
    pub snapshot_candidate_limit: usize,
    /// Delete commands without events (default: true)
    pub purge_orphaned_commands: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            snapshot_aggregate_type: None,
            snapshot_candidate_limit: 100,
            purge_orphaned_commands: true,
        }
    }
}

impl From<&Config> for MaintenanceConfig {
    fn from(config: &Config) -> Self {
        Self {
            snapshot_candidate_limit: config.snapshot_candidate_limit,
            ..Self::default()
        }
    }
}

/// Runs the maintenance jobs against one event store
pub struct MaintenanceJobs<S> {
    store: EventStore<S>,
    config: MaintenanceConfig,
}

impl<S: EventStorage> MaintenanceJobs<S> {
    pub fn new(store: EventStore<S>) -> Self {
        Self {
            store,
            config: MaintenanceConfig::default(),
        }
    }

    /// Create with custom configuration
    pub fn with_config(store: EventStore<S>, config: MaintenanceConfig) -> Self {
        Self { store, config }
    }

    /// Run every job once. A failing job is recorded in the report and does
    /// not stop the others.
    pub async fn run_all_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        if self.config.purge_orphaned_commands {
            match purge_orphaned_commands(&self.store, None).await {
                Ok(count) => report.orphaned_commands_deleted = count,
                Err(e) => report.errors.push(format!("Orphaned command purge: {}", e)),
            }
        }

        match find_snapshot_candidates(
            &self.store,
            self.config.snapshot_aggregate_type.as_deref(),
            self.config.snapshot_candidate_limit,
        )
        .await
        {
            Ok(candidates) => report.snapshot_candidates = candidates,
            Err(e) => report.errors.push(format!("Snapshot candidates: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running maintenance jobs
#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub orphaned_commands_deleted: u64,
    pub snapshot_candidates: Vec<Uuid>,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl MaintenanceReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),
}
