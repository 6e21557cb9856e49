//! Cursor Replay
//!
//! Bulk replay of stored events through the event handlers, for rebuilding
//! projections from history. Rows are read from a streaming query and
//! published one block at a time.

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use uuid::Uuid;

use crate::domain::Event;

use super::storage::{EventStorage, StoredEvent};
use super::{EventStore, EventStoreError};

/// Ordered description of the events to replay.
///
/// Every filter is optional; an empty query selects every event. Results are
/// always ascending by global position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayQuery {
    pub aggregate_ids: Option<Vec<Uuid>>,
    pub aggregate_types: Option<Vec<String>>,
    pub event_types: Option<Vec<String>>,
    /// Inclusive lower bound on `created_at`
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub created_until: Option<DateTime<Utc>>,
    /// Only events with a position strictly greater than this one
    pub after_position: Option<i64>,
}

impl ReplayQuery {
    /// Query selecting every stored event
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_aggregates(mut self, aggregate_ids: impl IntoIterator<Item = Uuid>) -> Self {
        self.aggregate_ids = Some(aggregate_ids.into_iter().collect());
        self
    }

    pub fn for_aggregate_types<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.aggregate_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn for_event_types<T: Into<String>>(mut self, types: impl IntoIterator<Item = T>) -> Self {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn created_between(
        mut self,
        from: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_from = from;
        self.created_until = until;
        self
    }

    /// Resume after a position reported by an earlier [`ReplayProgress`].
    ///
    /// Positions are allocated at insert time, not at commit time. A
    /// transaction that was still open during the earlier replay can commit
    /// events with positions at or below `position`; a resumed replay skips
    /// them. Replay from an earlier position (or from the start) when those
    /// events matter.
    pub fn after_position(mut self, position: i64) -> Self {
        self.after_position = Some(position);
        self
    }

    /// Whether `event`, belonging to a stream of `aggregate_type`, is selected
    pub fn matches(&self, event: &StoredEvent, aggregate_type: Option<&str>) -> bool {
        if let Some(ids) = &self.aggregate_ids {
            if !ids.contains(&event.aggregate_id) {
                return false;
            }
        }
        if let Some(types) = &self.aggregate_types {
            match aggregate_type {
                Some(aggregate_type) if types.iter().any(|t| t == aggregate_type) => {}
                _ => return false,
            }
        }
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| *t == event.event_type) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| event.created_at < from) {
            return false;
        }
        if self.created_until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.after_position.map_or(true, |after| event.id > after)
    }
}

/// Reported after every replayed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayProgress {
    /// Events processed so far, this block included
    pub events_processed: u64,
    /// Position of the first event in the block
    pub block_start: i64,
    /// Position of the last event in the block
    pub block_end: i64,
}

impl<S: EventStorage> EventStore<S> {
    /// Replay every event selected by `query` through the event handlers.
    ///
    /// Events are published in blocks of `block_size`, one publish call per
    /// block, and `on_progress` runs after each block. A handler failure
    /// aborts the replay; blocks already reported stay reported. To resume,
    /// rerun with [`ReplayQuery::after_position`] set to the last reported
    /// `block_end`.
    #[tracing::instrument(skip(self, query, on_progress))]
    pub async fn replay_events_from_cursor<F>(
        &self,
        query: &ReplayQuery,
        block_size: usize,
        mut on_progress: F,
    ) -> Result<u64, EventStoreError>
    where
        F: FnMut(ReplayProgress),
    {
        if block_size == 0 {
            return Err(EventStoreError::invalid_argument(
                "block_size must be greater than zero",
            ));
        }

        let mut rows = self.storage.stream_replay(query);
        let mut block: Vec<Event> = Vec::with_capacity(block_size);
        let mut processed = 0u64;

        while let Some(row) = rows.try_next().await? {
            block.push(self.decode_event(row)?);

            if block.len() == block_size {
                processed += self.replay_block(&block, processed, &mut on_progress).await?;
                block.clear();
            }
        }

        if !block.is_empty() {
            processed += self.replay_block(&block, processed, &mut on_progress).await?;
        }

        tracing::info!(events = processed, "Replay finished");
        Ok(processed)
    }

    async fn replay_block<F>(
        &self,
        block: &[Event],
        processed_before: u64,
        on_progress: &mut F,
    ) -> Result<u64, EventStoreError>
    where
        F: FnMut(ReplayProgress),
    {
        if !self.config.disable_event_handlers {
            self.publisher.publish(block).await?;
        }

        let progress = ReplayProgress {
            events_processed: processed_before + block.len() as u64,
            block_start: block.first().and_then(Event::position).unwrap_or_default(),
            block_end: block.last().and_then(Event::position).unwrap_or_default(),
        };
        tracing::info!(
            events_processed = progress.events_processed,
            block_start = progress.block_start,
            block_end = progress.block_end,
            "Replayed block"
        );
        on_progress(progress);

        Ok(block.len() as u64)
    }
}
