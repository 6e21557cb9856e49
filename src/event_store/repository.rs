//! Event Store Repository
//!
//! Core implementation of the Event Store pattern.
//! Provides atomic event persistence with optimistic concurrency control,
//! history loading from the latest snapshot, and the snapshot lifecycle.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use uuid::Uuid;

use crate::config::EventStoreConfig;
use crate::domain::{Command, Event, EventStream, StoredCommand};
use crate::projection::EventPublisher;
use crate::serialization::EventTypeRegistry;

use super::storage::{
    EventStorage, NewEventRecord, StorageError, StorageTransaction, StoredEvent, StoredHistory,
    StoredSnapshot,
};
use super::EventStoreError;

/// Outcome of a successful [`EventStore::commit_events`]
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    /// Id of the stored command
    pub command_id: i64,

    /// Committed events, with their global positions filled in
    pub events: Vec<Event>,

    /// Touched aggregates whose snapshot threshold has been reached
    pub snapshot_candidates: Vec<Uuid>,
}

/// Event Store for persisting and retrieving events
pub struct EventStore<S> {
    pub(super) storage: Arc<S>,
    registry: Arc<EventTypeRegistry>,
    pub(super) config: Arc<EventStoreConfig>,
    pub(super) publisher: EventPublisher,
}

impl<S> Clone for EventStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

impl<S> fmt::Debug for EventStore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn validate_batches(batches: &[(EventStream, Vec<Event>)]) -> Result<(), EventStoreError> {
    if batches.is_empty() {
        return Err(EventStoreError::invalid_argument(
            "commit requires at least one event stream",
        ));
    }

    let mut seen = HashSet::with_capacity(batches.len());
    for (stream, events) in batches {
        if !seen.insert(stream.aggregate_id) {
            return Err(EventStoreError::invalid_argument(format!(
                "aggregate {} appears in more than one batch",
                stream.aggregate_id
            )));
        }
        if stream.snapshot_threshold.is_some_and(|threshold| threshold <= 0) {
            return Err(EventStoreError::invalid_argument(format!(
                "snapshot_threshold of aggregate {} must be greater than zero",
                stream.aggregate_id
            )));
        }

        let mut previous = 0;
        for event in events {
            if event.is_snapshot() {
                return Err(EventStoreError::invalid_argument(format!(
                    "snapshot {}#{} cannot be committed as an event, use store_snapshots",
                    event.aggregate_id(),
                    event.sequence_number()
                )));
            }
            if event.aggregate_id() != stream.aggregate_id {
                return Err(EventStoreError::invalid_argument(format!(
                    "event for aggregate {} in the stream of aggregate {}",
                    event.aggregate_id(),
                    stream.aggregate_id
                )));
            }
            if event.sequence_number() <= previous {
                return Err(EventStoreError::invalid_argument(format!(
                    "sequence number {} of aggregate {} must be positive and increasing",
                    event.sequence_number(),
                    stream.aggregate_id
                )));
            }
            previous = event.sequence_number();
        }
    }

    Ok(())
}

fn event_record(event: &Event) -> Result<NewEventRecord, EventStoreError> {
    let serialized = EventTypeRegistry::encode(event.data())?;
    Ok(NewEventRecord {
        aggregate_id: event.aggregate_id(),
        sequence_number: event.sequence_number(),
        created_at: event.created_at(),
        event_type: serialized.type_tag,
        payload: serialized.payload,
    })
}

async fn rollback<T: StorageTransaction>(tx: T) {
    if let Err(error) = tx.rollback().await {
        tracing::warn!(error = %error, "Rollback failed");
    }
}

impl<S: EventStorage> EventStore<S> {
    /// Create a new EventStore over `storage`
    pub fn new(storage: S, registry: EventTypeRegistry, config: EventStoreConfig) -> Self {
        let publisher = EventPublisher::new(config.event_handlers.clone());
        Self {
            storage: Arc::new(storage),
            registry: Arc::new(registry),
            config: Arc::new(config),
            publisher,
        }
    }

    /// Same storage and registry, with `config` replacing the current
    /// configuration entirely
    pub fn with_config(&self, config: EventStoreConfig) -> Self {
        Self {
            storage: self.storage.clone(),
            registry: self.registry.clone(),
            publisher: EventPublisher::new(config.event_handlers.clone()),
            config: Arc::new(config),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    pub(super) fn decode_event(&self, row: StoredEvent) -> Result<Event, EventStoreError> {
        let data = self.registry.decode(&row.event_type, row.payload)?;
        Ok(Event::restore(
            row.aggregate_id,
            row.sequence_number,
            row.created_at,
            Some(row.id),
            false,
            data,
        ))
    }

    fn decode_snapshot(&self, row: StoredSnapshot) -> Result<Event, EventStoreError> {
        let data = self.registry.decode(&row.snapshot_type, row.payload)?;
        Ok(Event::restore(
            row.aggregate_id,
            row.sequence_number,
            row.created_at,
            None,
            true,
            data,
        ))
    }

    fn decode_history(
        &self,
        stream: EventStream,
        history: StoredHistory,
    ) -> Result<(EventStream, Vec<Event>), EventStoreError> {
        let mut events = Vec::with_capacity(history.events.len() + 1);
        if let Some(snapshot) = history.snapshot {
            events.push(self.decode_snapshot(snapshot)?);
        }
        for row in history.events {
            events.push(self.decode_event(row)?);
        }
        Ok((stream, events))
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Atomically store `command` and the events of every batch, then publish
    /// them to the event handlers before the transaction commits.
    ///
    /// A concurrent writer that claimed any `(aggregate_id, sequence_number)`
    /// first makes the whole commit fail with
    /// [`EventStoreError::OptimisticLocking`]. A failing handler rolls the
    /// commit back and surfaces as [`EventStoreError::PublishEvent`].
    #[tracing::instrument(
        skip(self, command, batches),
        fields(command_type = %command.command_type, aggregate_id = %command.aggregate_id)
    )]
    pub async fn commit_events(
        &self,
        command: &Command,
        batches: Vec<(EventStream, Vec<Event>)>,
    ) -> Result<CommitReceipt, EventStoreError> {
        validate_batches(&batches)?;

        let records = batches
            .iter()
            .map(|(_, events)| events.iter().map(event_record).collect::<Result<Vec<_>, _>>())
            .collect::<Result<Vec<Vec<NewEventRecord>>, _>>()?;

        let mut tx = self.storage.begin().await?;
        let written = self.write_batches(&mut tx, command, &batches, &records).await;
        let result = match written {
            Ok(receipt) => tx.commit().await.map(|()| receipt).map_err(EventStoreError::from),
            Err(err) => {
                rollback(tx).await;
                Err(err)
            }
        };

        let (command_id, events) = match result {
            Ok(committed) => committed,
            Err(err) => {
                if err.is_concurrency_conflict() {
                    tracing::warn!(error = %err, "Optimistic locking conflict, commit aborted");
                }
                return Err(err);
            }
        };

        tracing::debug!(command_id, events = events.len(), "Events committed");

        let touched: Vec<Uuid> = batches.iter().map(|(stream, _)| stream.aggregate_id).collect();
        let snapshot_candidates = self.snapshot_candidates_among(&touched).await;

        Ok(CommitReceipt {
            command_id,
            events,
            snapshot_candidates,
        })
    }

    async fn write_batches(
        &self,
        tx: &mut S::Transaction,
        command: &Command,
        batches: &[(EventStream, Vec<Event>)],
        records: &[Vec<NewEventRecord>],
    ) -> Result<(i64, Vec<Event>), EventStoreError> {
        let command_id = tx.insert_command(command).await?;
        let mut committed = Vec::with_capacity(records.iter().map(Vec::len).sum());

        for ((stream, events), records) in batches.iter().zip(records) {
            let stored_type = tx.insert_stream(stream).await?;
            if stored_type != stream.aggregate_type {
                return Err(EventStoreError::invalid_argument(format!(
                    "aggregate {} has type {stored_type}, not {}",
                    stream.aggregate_id, stream.aggregate_type
                )));
            }
            let positions = tx.insert_events(command_id, records).await?;
            committed.extend(
                events
                    .iter()
                    .zip(positions)
                    .map(|(event, position)| event.clone().with_position(position)),
            );
        }

        if !self.config.disable_event_handlers {
            self.publisher.publish(&committed).await?;
        }

        Ok((command_id, committed))
    }

    /// Auto-snapshot check, run after commit. Never fails the commit.
    async fn snapshot_candidates_among(&self, aggregate_ids: &[Uuid]) -> Vec<Uuid> {
        match self.check_snapshot_thresholds(aggregate_ids).await {
            Ok(candidates) => candidates,
            Err(error) => {
                tracing::warn!(error = %error, "Snapshot threshold check failed");
                Vec::new()
            }
        }
    }

    async fn check_snapshot_thresholds(&self, aggregate_ids: &[Uuid]) -> Result<Vec<Uuid>, StorageError> {
        let streams = self.storage.find_streams(aggregate_ids).await?;
        let mut candidates = Vec::new();

        for stream in &streams {
            let Some(threshold) = stream.snapshot_threshold else {
                continue;
            };
            let count = self
                .storage
                .events_since_latest_snapshot(stream.aggregate_id)
                .await?;
            if count >= i64::from(threshold) {
                tracing::info!(
                    aggregate_id = %stream.aggregate_id,
                    aggregate_type = %stream.aggregate_type,
                    events_since_snapshot = count,
                    threshold,
                    "Aggregate needs a snapshot"
                );
                candidates.push(stream.aggregate_id);
            }
        }

        candidates.sort_by_key(|id| aggregate_ids.iter().position(|touched| touched == id));
        Ok(candidates)
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Load a stream with its history, starting from the latest snapshot.
    ///
    /// Returns `None` if the aggregate has no stream.
    #[tracing::instrument(skip(self))]
    pub async fn load_events(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<(EventStream, Vec<Event>)>, EventStoreError> {
        let mut loaded = self.load_events_for_aggregates(&[aggregate_id]).await?;
        Ok(loaded.pop())
    }

    /// Batched [`load_events`](Self::load_events).
    ///
    /// One entry per distinct id with a stream, in the order given.
    #[tracing::instrument(skip(self, aggregate_ids), fields(aggregates = aggregate_ids.len()))]
    pub async fn load_events_for_aggregates(
        &self,
        aggregate_ids: &[Uuid],
    ) -> Result<Vec<(EventStream, Vec<Event>)>, EventStoreError> {
        let mut seen = HashSet::with_capacity(aggregate_ids.len());
        let ids: Vec<Uuid> = aggregate_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut streams: HashMap<Uuid, EventStream> = self
            .storage
            .find_streams(&ids)
            .await?
            .into_iter()
            .map(|stream| (stream.aggregate_id, stream))
            .collect();
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let with_stream: Vec<Uuid> = ids.iter().copied().filter(|id| streams.contains_key(id)).collect();
        let mut histories: HashMap<Uuid, StoredHistory> = self
            .storage
            .load_histories(&with_stream)
            .await?
            .into_iter()
            .map(|history| (history.aggregate_id, history))
            .collect();

        with_stream
            .into_iter()
            .filter_map(|id| {
                let stream = streams.remove(&id)?;
                let history = histories
                    .remove(&id)
                    .unwrap_or_else(|| StoredHistory::empty(id));
                Some(self.decode_history(stream, history))
            })
            .collect()
    }

    /// Load exactly one event
    pub async fn load_event(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<Option<Event>, EventStoreError> {
        self.storage
            .load_event(aggregate_id, sequence_number)
            .await?
            .map(|row| self.decode_event(row))
            .transpose()
    }

    /// Stream metadata only
    pub async fn find_event_stream(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Option<EventStream>, EventStoreError> {
        let mut streams = self.storage.find_streams(&[aggregate_id]).await?;
        Ok(streams.pop())
    }

    /// Feed an aggregate's events to `consumer` one at a time, ascending,
    /// without materialising the history. Snapshots are not delivered.
    ///
    /// Fails with [`EventStoreError::InvalidArgument`] when the aggregate has
    /// no stream or no event was created at or before `load_until`. Returns
    /// the number of events delivered.
    #[tracing::instrument(skip(self, consumer))]
    pub async fn stream_events_for_aggregate<F>(
        &self,
        aggregate_id: Uuid,
        load_until: Option<DateTime<Utc>>,
        mut consumer: F,
    ) -> Result<u64, EventStoreError>
    where
        F: FnMut(&EventStream, Event),
    {
        let stream = self.find_event_stream(aggregate_id).await?.ok_or_else(|| {
            EventStoreError::invalid_argument(format!("no event stream for aggregate {aggregate_id}"))
        })?;

        let mut rows = self.storage.stream_events(aggregate_id, load_until);
        let mut delivered = 0u64;
        while let Some(row) = rows.try_next().await? {
            consumer(&stream, self.decode_event(row)?);
            delivered += 1;
        }

        if delivered == 0 {
            return Err(EventStoreError::invalid_argument(match load_until {
                Some(until) => format!("no events for aggregate {aggregate_id} until {until}"),
                None => format!("no events for aggregate {aggregate_id}"),
            }));
        }

        Ok(delivered)
    }

    pub async fn events_exist(&self, aggregate_id: Uuid) -> Result<bool, EventStoreError> {
        Ok(self.storage.events_exist(aggregate_id).await?)
    }

    pub async fn stream_exists(&self, aggregate_id: Uuid) -> Result<bool, EventStoreError> {
        Ok(self.storage.stream_exists(aggregate_id).await?)
    }

    /// Commands recorded for an aggregate, oldest first
    pub async fn commands_for_aggregate(
        &self,
        aggregate_id: Uuid,
    ) -> Result<Vec<StoredCommand>, EventStoreError> {
        Ok(self.storage.commands_for_aggregate(aggregate_id).await?)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Aggregates with a snapshot threshold that is reached, or whose latest
    /// snapshot is older than the stream's `snapshot_outdated_after`
    #[tracing::instrument(skip(self))]
    pub async fn aggregates_that_need_snapshots(
        &self,
        aggregate_type: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Uuid>, EventStoreError> {
        if limit == 0 {
            return Err(EventStoreError::invalid_argument("limit must be greater than zero"));
        }

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self
            .storage
            .aggregates_that_need_snapshots(aggregate_type, Utc::now(), limit)
            .await?)
    }

    /// Change a stream's snapshot policy; `false` if there is no such stream
    pub async fn update_snapshot_policy(
        &self,
        aggregate_id: Uuid,
        snapshot_threshold: Option<i32>,
        snapshot_outdated_after: Option<Duration>,
    ) -> Result<bool, EventStoreError> {
        if snapshot_threshold.is_some_and(|threshold| threshold <= 0) {
            return Err(EventStoreError::invalid_argument(
                "snapshot_threshold must be greater than zero",
            ));
        }

        Ok(self
            .storage
            .update_snapshot_policy(aggregate_id, snapshot_threshold, snapshot_outdated_after)
            .await?)
    }

    /// Store snapshots atomically: all of them or none
    #[tracing::instrument(skip(self, snapshots), fields(snapshots = snapshots.len()))]
    pub async fn store_snapshots(&self, snapshots: &[Event]) -> Result<(), EventStoreError> {
        let mut rows = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            if !snapshot.is_snapshot() {
                return Err(EventStoreError::invalid_argument(format!(
                    "{} {}#{} is an event, not a snapshot",
                    snapshot.type_tag(),
                    snapshot.aggregate_id(),
                    snapshot.sequence_number()
                )));
            }
            if !self.config.accepts_snapshot_type(snapshot.type_tag()) {
                return Err(EventStoreError::invalid_argument(format!(
                    "snapshot type {} is not configured",
                    snapshot.type_tag()
                )));
            }
            if snapshot.sequence_number() <= 0 {
                return Err(EventStoreError::invalid_argument(format!(
                    "snapshot sequence number {} must be positive",
                    snapshot.sequence_number()
                )));
            }

            let serialized = EventTypeRegistry::encode(snapshot.data())?;
            rows.push(StoredSnapshot {
                aggregate_id: snapshot.aggregate_id(),
                sequence_number: snapshot.sequence_number(),
                created_at: snapshot.created_at(),
                snapshot_type: serialized.type_tag,
                payload: serialized.payload,
            });
        }
        if rows.is_empty() {
            return Ok(());
        }

        let ids: Vec<Uuid> = rows
            .iter()
            .map(|row| row.aggregate_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let existing: HashSet<Uuid> = self
            .storage
            .find_streams(&ids)
            .await?
            .into_iter()
            .map(|stream| stream.aggregate_id)
            .collect();
        if let Some(missing) = ids.iter().find(|id| !existing.contains(id)) {
            return Err(EventStoreError::invalid_argument(format!(
                "no event stream for aggregate {missing}"
            )));
        }

        self.storage.insert_snapshots(&rows).await?;
        tracing::info!(snapshots = rows.len(), "Snapshots stored");
        Ok(())
    }

    /// Highest-sequence snapshot of an aggregate
    pub async fn load_latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<Event>, EventStoreError> {
        self.storage
            .latest_snapshot(aggregate_id)
            .await?
            .map(|row| self.decode_snapshot(row))
            .transpose()
    }

    /// Delete snapshots with a sequence number below `sequence_number`
    pub async fn delete_snapshots_before(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<u64, EventStoreError> {
        let deleted = self
            .storage
            .delete_snapshots_before(aggregate_id, sequence_number)
            .await?;
        tracing::debug!(%aggregate_id, sequence_number, deleted, "Old snapshots deleted");
        Ok(deleted)
    }

    // =========================================================================
    // Permanent deletion (maintenance only)
    // =========================================================================

    /// Delete a stream with all its events and snapshots.
    ///
    /// Irreversible. Returns whether the stream existed.
    #[tracing::instrument(skip(self))]
    pub async fn permanently_delete_event_stream(&self, aggregate_id: Uuid) -> Result<bool, EventStoreError> {
        let mut tx = self.storage.begin().await?;
        let deleted = match tx.delete_stream(aggregate_id).await {
            Ok(deleted) => deleted,
            Err(error) => {
                rollback(tx).await;
                return Err(error.into());
            }
        };
        tx.commit().await?;

        if deleted {
            tracing::info!(%aggregate_id, "Event stream permanently deleted");
        }
        Ok(deleted)
    }

    /// Delete commands that no stored event references, optionally only
    /// those of one aggregate. Returns the number deleted.
    #[tracing::instrument(skip(self))]
    pub async fn permanently_delete_commands_without_events(
        &self,
        aggregate_id: Option<Uuid>,
    ) -> Result<u64, EventStoreError> {
        let deleted = self.storage.delete_commands_without_events(aggregate_id).await?;
        tracing::info!(deleted, "Orphaned commands deleted");
        Ok(deleted)
    }
}
