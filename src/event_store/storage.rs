//! Persistence gateway
//!
//! The storage contract the event store is written against. Implementations:
//! - [`super::PostgresStorage`]: PostgreSQL via `sqlx`
//! - [`super::InMemoryStorage`]: in-process tables for tests and embedding
//!
//! Every implementation must reject a second row for the same
//! `(aggregate_id, sequence_number)` with [`StorageError::UniqueViolation`];
//! that rejection is the whole optimistic locking protocol.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::domain::{Command, EventStream, StoredCommand};

use super::ReplayQuery;

/// Storage-layer errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A uniqueness constraint rejected the write
    #[error("unique constraint violated: {0}")]
    UniqueViolation(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Query execution or transaction failure
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl StorageError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StorageError::UniqueViolation(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(error: sqlx::Error) -> Self {
        let unique = matches!(&error, sqlx::Error::Database(db) if db.is_unique_violation());
        if unique {
            StorageError::UniqueViolation(Box::new(error))
        } else {
            StorageError::Database(error)
        }
    }
}

/// Key collision reported by storages without a database error of their own
#[derive(Debug, thiserror::Error)]
#[error("duplicate key (aggregate_id, sequence_number) = ({aggregate_id}, {sequence_number})")]
pub struct DuplicateKey {
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
}

/// Event row to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewEventRecord {
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Stored event row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Global insertion order
    pub id: i64,
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
    pub created_at: DateTime<Utc>,
    pub command_id: Option<i64>,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Stored snapshot row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    pub aggregate_id: Uuid,
    pub sequence_number: i64,
    pub created_at: DateTime<Utc>,
    pub snapshot_type: String,
    pub payload: serde_json::Value,
}

/// Latest snapshot plus every event after it, for one aggregate
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHistory {
    pub aggregate_id: Uuid,
    pub snapshot: Option<StoredSnapshot>,
    pub events: Vec<StoredEvent>,
}

impl StoredHistory {
    pub fn empty(aggregate_id: Uuid) -> Self {
        Self {
            aggregate_id,
            snapshot: None,
            events: Vec::new(),
        }
    }
}

/// Durable storage for streams, events, snapshots and commands
#[async_trait]
pub trait EventStorage: Send + Sync + 'static {
    type Transaction: StorageTransaction;

    /// Open a transaction for a commit or a stream deletion
    async fn begin(&self) -> Result<Self::Transaction, StorageError>;

    async fn find_streams(&self, aggregate_ids: &[Uuid]) -> Result<Vec<EventStream>, StorageError>;

    async fn stream_exists(&self, aggregate_id: Uuid) -> Result<bool, StorageError>;

    async fn events_exist(&self, aggregate_id: Uuid) -> Result<bool, StorageError>;

    /// Change a stream's snapshot policy; `false` if the stream does not exist
    async fn update_snapshot_policy(
        &self,
        aggregate_id: Uuid,
        snapshot_threshold: Option<i32>,
        snapshot_outdated_after: Option<Duration>,
    ) -> Result<bool, StorageError>;

    /// Latest snapshot and following events for each id, in a single query.
    ///
    /// Ids without any rows may be omitted from the result.
    async fn load_histories(&self, aggregate_ids: &[Uuid]) -> Result<Vec<StoredHistory>, StorageError>;

    async fn load_event(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<Option<StoredEvent>, StorageError>;

    /// Stream one aggregate's events ascending by sequence number, optionally
    /// bounded to `created_at <= until`, without buffering the result set
    fn stream_events(
        &self,
        aggregate_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> BoxStream<'_, Result<StoredEvent, StorageError>>;

    /// Stream every event matching `query`, ascending by global position
    fn stream_replay(&self, query: &ReplayQuery) -> BoxStream<'_, Result<StoredEvent, StorageError>>;

    /// Number of events after the latest snapshot (all events if none)
    async fn events_since_latest_snapshot(&self, aggregate_id: Uuid) -> Result<i64, StorageError>;

    async fn aggregates_that_need_snapshots(
        &self,
        aggregate_type: Option<&str>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StorageError>;

    /// Insert snapshots atomically: all or none
    async fn insert_snapshots(&self, snapshots: &[StoredSnapshot]) -> Result<(), StorageError>;

    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredSnapshot>, StorageError>;

    async fn delete_snapshots_before(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<u64, StorageError>;

    async fn commands_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<StoredCommand>, StorageError>;

    /// Delete commands no stored event references, optionally only those of one aggregate
    async fn delete_commands_without_events(
        &self,
        aggregate_id: Option<Uuid>,
    ) -> Result<u64, StorageError>;
}

/// Writes that must become visible together or not at all
#[async_trait]
pub trait StorageTransaction: Send + Sized {
    /// Insert the stream unless one already exists for its aggregate id.
    ///
    /// Returns the aggregate type of the stream as stored.
    async fn insert_stream(&mut self, stream: &EventStream) -> Result<String, StorageError>;

    /// Insert a command, returning its id
    async fn insert_command(&mut self, command: &Command) -> Result<i64, StorageError>;

    /// Insert events in order, returning their global positions in the same order
    async fn insert_events(
        &mut self,
        command_id: i64,
        events: &[NewEventRecord],
    ) -> Result<Vec<i64>, StorageError>;

    /// Delete a stream with its events and snapshots; `false` if it did not exist
    async fn delete_stream(&mut self, aggregate_id: Uuid) -> Result<bool, StorageError>;

    async fn commit(self) -> Result<(), StorageError>;

    async fn rollback(self) -> Result<(), StorageError>;
}
