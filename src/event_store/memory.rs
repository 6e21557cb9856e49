//! In-memory storage
//!
//! Thread-safe, process-local implementation of [`EventStorage`] for tests
//! and embedding. Transactions buffer their writes and apply them on commit.
//! An inserted event key is reserved until its transaction ends, so a second
//! transaction inserting the same key fails at insert time, as it would on the
//! Postgres unique index, before anything is published.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use crate::domain::{Command, EventStream, StoredCommand};

use super::storage::{
    DuplicateKey, EventStorage, NewEventRecord, StorageError, StorageTransaction, StoredEvent,
    StoredHistory, StoredSnapshot,
};
use super::ReplayQuery;

type Key = (Uuid, i64);

#[derive(Default)]
struct Tables {
    streams: BTreeMap<Uuid, EventStream>,
    events: BTreeMap<Key, StoredEvent>,
    snapshots: BTreeMap<Key, StoredSnapshot>,
    commands: BTreeMap<i64, StoredCommand>,
    /// Event keys claimed by open transactions
    pending: BTreeSet<Key>,
    last_event_id: i64,
    last_command_id: i64,
}

impl Tables {
    fn latest_snapshot(&self, aggregate_id: Uuid) -> Option<&StoredSnapshot> {
        self.snapshots
            .range((aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX))
            .next_back()
            .map(|(_, snapshot)| snapshot)
    }

    fn events_after(&self, aggregate_id: Uuid, sequence_number: i64) -> impl Iterator<Item = &StoredEvent> {
        self.events
            .range((aggregate_id, sequence_number.saturating_add(1))..=(aggregate_id, i64::MAX))
            .map(|(_, event)| event)
    }

    fn events_since_latest_snapshot(&self, aggregate_id: Uuid) -> i64 {
        let from = self
            .latest_snapshot(aggregate_id)
            .map_or(0, |snapshot| snapshot.sequence_number);
        self.events_after(aggregate_id, from).count() as i64
    }

    fn snapshot_outdated(&self, stream: &EventStream, now: DateTime<Utc>) -> bool {
        let (Some(outdated_after), Some(latest)) = (
            stream.snapshot_outdated_after,
            self.latest_snapshot(stream.aggregate_id),
        ) else {
            return false;
        };
        chrono::Duration::from_std(outdated_after)
            .map(|age| latest.created_at < now - age)
            .unwrap_or(false)
    }

    fn remove_stream(&mut self, aggregate_id: Uuid) -> bool {
        let range = (aggregate_id, i64::MIN)..=(aggregate_id, i64::MAX);
        let event_keys: Vec<Key> = self.events.range(range.clone()).map(|(k, _)| *k).collect();
        for key in event_keys {
            self.events.remove(&key);
        }
        let snapshot_keys: Vec<Key> = self.snapshots.range(range).map(|(k, _)| *k).collect();
        for key in snapshot_keys {
            self.snapshots.remove(&key);
        }
        self.streams.remove(&aggregate_id).is_some()
    }
}

fn lock(tables: &Mutex<Tables>) -> MutexGuard<'_, Tables> {
    tables.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duplicate(aggregate_id: Uuid, sequence_number: i64) -> StorageError {
    StorageError::UniqueViolation(Box::new(DuplicateKey {
        aggregate_id,
        sequence_number,
    }))
}

/// In-memory event storage
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all streams
    pub fn event_count(&self) -> usize {
        lock(&self.tables).events.len()
    }

    /// Total number of stored commands
    pub fn command_count(&self) -> usize {
        lock(&self.tables).commands.len()
    }
}

/// Buffered writes of one in-memory transaction
pub struct InMemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    streams: Vec<EventStream>,
    commands: Vec<StoredCommand>,
    events: Vec<StoredEvent>,
    deleted_streams: Vec<Uuid>,
}

impl InMemoryTransaction {
    fn release_claims(&mut self) {
        if self.events.is_empty() {
            return;
        }
        let mut tables = lock(&self.tables);
        for event in self.events.drain(..) {
            tables.pending.remove(&(event.aggregate_id, event.sequence_number));
        }
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        self.release_claims();
    }
}

#[async_trait]
impl StorageTransaction for InMemoryTransaction {
    async fn insert_stream(&mut self, stream: &EventStream) -> Result<String, StorageError> {
        let committed = lock(&self.tables)
            .streams
            .get(&stream.aggregate_id)
            .map(|existing| existing.aggregate_type.clone());
        let stored = committed.or_else(|| {
            self.streams
                .iter()
                .find(|pending| pending.aggregate_id == stream.aggregate_id)
                .map(|pending| pending.aggregate_type.clone())
        });

        match stored {
            Some(aggregate_type) => Ok(aggregate_type),
            None => {
                self.streams.push(stream.clone());
                Ok(stream.aggregate_type.clone())
            }
        }
    }

    async fn insert_command(&mut self, command: &Command) -> Result<i64, StorageError> {
        let id = {
            let mut tables = lock(&self.tables);
            tables.last_command_id += 1;
            tables.last_command_id
        };
        self.commands.push(StoredCommand {
            id,
            command_type: command.command_type.clone(),
            aggregate_id: command.aggregate_id,
            payload: command.payload.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn insert_events(
        &mut self,
        command_id: i64,
        events: &[NewEventRecord],
    ) -> Result<Vec<i64>, StorageError> {
        let mut tables = lock(&self.tables);
        let mut positions = Vec::with_capacity(events.len());

        if let Some(taken) = events.iter().enumerate().find(|(index, record)| {
            let key = (record.aggregate_id, record.sequence_number);
            tables.events.contains_key(&key)
                || tables.pending.contains(&key)
                || events[..*index]
                    .iter()
                    .any(|other| (other.aggregate_id, other.sequence_number) == key)
        }) {
            let (_, record) = taken;
            return Err(duplicate(record.aggregate_id, record.sequence_number));
        }

        for record in events {
            tables.pending.insert((record.aggregate_id, record.sequence_number));

            // ids behave like a sequence: allocated now, lost on rollback
            tables.last_event_id += 1;
            positions.push(tables.last_event_id);
            self.events.push(StoredEvent {
                id: tables.last_event_id,
                aggregate_id: record.aggregate_id,
                sequence_number: record.sequence_number,
                created_at: record.created_at,
                command_id: Some(command_id),
                event_type: record.event_type.clone(),
                payload: record.payload.clone(),
            });
        }

        Ok(positions)
    }

    async fn delete_stream(&mut self, aggregate_id: Uuid) -> Result<bool, StorageError> {
        let exists = lock(&self.tables).streams.contains_key(&aggregate_id)
            || self
                .streams
                .iter()
                .any(|pending| pending.aggregate_id == aggregate_id);
        if exists {
            self.deleted_streams.push(aggregate_id);
        }
        Ok(exists)
    }

    async fn commit(mut self) -> Result<(), StorageError> {
        let shared = self.tables.clone();
        let mut tables = lock(&shared);

        for stream in self.streams.drain(..) {
            tables.streams.entry(stream.aggregate_id).or_insert(stream);
        }
        for command in self.commands.drain(..) {
            tables.commands.insert(command.id, command);
        }
        for event in self.events.drain(..) {
            let key = (event.aggregate_id, event.sequence_number);
            tables.pending.remove(&key);
            tables.events.insert(key, event);
        }
        for aggregate_id in self.deleted_streams.drain(..) {
            tables.remove_stream(aggregate_id);
        }

        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StorageError> {
        self.release_claims();
        Ok(())
    }
}

#[async_trait]
impl EventStorage for InMemoryStorage {
    type Transaction = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction, StorageError> {
        Ok(InMemoryTransaction {
            tables: self.tables.clone(),
            streams: Vec::new(),
            commands: Vec::new(),
            events: Vec::new(),
            deleted_streams: Vec::new(),
        })
    }

    async fn find_streams(&self, aggregate_ids: &[Uuid]) -> Result<Vec<EventStream>, StorageError> {
        let tables = lock(&self.tables);
        Ok(aggregate_ids
            .iter()
            .filter_map(|id| tables.streams.get(id).cloned())
            .collect())
    }

    async fn stream_exists(&self, aggregate_id: Uuid) -> Result<bool, StorageError> {
        Ok(lock(&self.tables).streams.contains_key(&aggregate_id))
    }

    async fn events_exist(&self, aggregate_id: Uuid) -> Result<bool, StorageError> {
        Ok(lock(&self.tables).events_after(aggregate_id, i64::MIN).next().is_some())
    }

    async fn update_snapshot_policy(
        &self,
        aggregate_id: Uuid,
        snapshot_threshold: Option<i32>,
        snapshot_outdated_after: Option<Duration>,
    ) -> Result<bool, StorageError> {
        let mut tables = lock(&self.tables);
        match tables.streams.get_mut(&aggregate_id) {
            Some(stream) => {
                stream.snapshot_threshold = snapshot_threshold;
                stream.snapshot_outdated_after = snapshot_outdated_after;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn load_histories(&self, aggregate_ids: &[Uuid]) -> Result<Vec<StoredHistory>, StorageError> {
        let tables = lock(&self.tables);
        Ok(aggregate_ids
            .iter()
            .map(|&aggregate_id| {
                let snapshot = tables.latest_snapshot(aggregate_id).cloned();
                let from = snapshot.as_ref().map_or(0, |s| s.sequence_number);
                StoredHistory {
                    aggregate_id,
                    snapshot,
                    events: tables.events_after(aggregate_id, from).cloned().collect(),
                }
            })
            .collect())
    }

    async fn load_event(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<Option<StoredEvent>, StorageError> {
        Ok(lock(&self.tables)
            .events
            .get(&(aggregate_id, sequence_number))
            .cloned())
    }

    fn stream_events(
        &self,
        aggregate_id: Uuid,
        until: Option<DateTime<Utc>>,
    ) -> BoxStream<'_, Result<StoredEvent, StorageError>> {
        let rows: Vec<StoredEvent> = lock(&self.tables)
            .events_after(aggregate_id, i64::MIN)
            .filter(|event| until.map_or(true, |until| event.created_at <= until))
            .cloned()
            .collect();
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }

    fn stream_replay(&self, query: &ReplayQuery) -> BoxStream<'_, Result<StoredEvent, StorageError>> {
        let tables = lock(&self.tables);
        let mut rows: Vec<StoredEvent> = tables
            .events
            .values()
            .filter(|event| {
                let aggregate_type = tables
                    .streams
                    .get(&event.aggregate_id)
                    .map(|stream| stream.aggregate_type.as_str());
                query.matches(event, aggregate_type)
            })
            .cloned()
            .collect();
        drop(tables);

        rows.sort_by_key(|event| event.id);
        stream::iter(rows.into_iter().map(Ok)).boxed()
    }

    async fn events_since_latest_snapshot(&self, aggregate_id: Uuid) -> Result<i64, StorageError> {
        Ok(lock(&self.tables).events_since_latest_snapshot(aggregate_id))
    }

    async fn aggregates_that_need_snapshots(
        &self,
        aggregate_type: Option<&str>,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Uuid>, StorageError> {
        let tables = lock(&self.tables);
        let limit = usize::try_from(limit).unwrap_or(0);

        Ok(tables
            .streams
            .values()
            .filter(|stream| aggregate_type.map_or(true, |t| stream.aggregate_type == t))
            .filter(|stream| match stream.snapshot_threshold {
                Some(threshold) => {
                    tables.events_since_latest_snapshot(stream.aggregate_id) >= i64::from(threshold)
                        || tables.snapshot_outdated(stream, now)
                }
                None => false,
            })
            .map(|stream| stream.aggregate_id)
            .take(limit)
            .collect())
    }

    async fn insert_snapshots(&self, snapshots: &[StoredSnapshot]) -> Result<(), StorageError> {
        let mut tables = lock(&self.tables);

        for (index, snapshot) in snapshots.iter().enumerate() {
            let key = (snapshot.aggregate_id, snapshot.sequence_number);
            let repeated = snapshots[..index]
                .iter()
                .any(|s| (s.aggregate_id, s.sequence_number) == key);
            if repeated || tables.snapshots.contains_key(&key) {
                return Err(duplicate(snapshot.aggregate_id, snapshot.sequence_number));
            }
        }

        for snapshot in snapshots {
            tables.snapshots.insert(
                (snapshot.aggregate_id, snapshot.sequence_number),
                snapshot.clone(),
            );
        }
        Ok(())
    }

    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredSnapshot>, StorageError> {
        Ok(lock(&self.tables).latest_snapshot(aggregate_id).cloned())
    }

    async fn delete_snapshots_before(
        &self,
        aggregate_id: Uuid,
        sequence_number: i64,
    ) -> Result<u64, StorageError> {
        let mut tables = lock(&self.tables);
        let keys: Vec<Key> = tables
            .snapshots
            .range((aggregate_id, i64::MIN)..(aggregate_id, sequence_number))
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            tables.snapshots.remove(key);
        }
        Ok(keys.len() as u64)
    }

    async fn commands_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<StoredCommand>, StorageError> {
        Ok(lock(&self.tables)
            .commands
            .values()
            .filter(|command| command.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn delete_commands_without_events(
        &self,
        aggregate_id: Option<Uuid>,
    ) -> Result<u64, StorageError> {
        let mut tables = lock(&self.tables);
        let referenced: std::collections::HashSet<i64> = tables
            .events
            .values()
            .filter_map(|event| event.command_id)
            .collect();

        let orphans: Vec<i64> = tables
            .commands
            .values()
            .filter(|command| aggregate_id.map_or(true, |id| command.aggregate_id == id))
            .filter(|command| !referenced.contains(&command.id))
            .map(|command| command.id)
            .collect();
        for id in &orphans {
            tables.commands.remove(id);
        }
        Ok(orphans.len() as u64)
    }
}
