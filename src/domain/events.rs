//! Domain Events
//!
//! Events are immutable facts about an aggregate. Snapshots share the same
//! shape and sequence space but capture aggregate state instead of a fact.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use uuid::Uuid;

use crate::serialization::{EventData, EventType};

/// An event or snapshot belonging to one aggregate's stream
#[derive(Debug, Clone)]
pub struct Event {
    aggregate_id: Uuid,
    sequence_number: i64,
    created_at: DateTime<Utc>,
    position: Option<i64>,
    snapshot: bool,
    data: Arc<dyn EventData>,
}

impl Event {
    /// Create a new event for `aggregate_id` at `sequence_number`
    pub fn new<T: EventType>(aggregate_id: Uuid, sequence_number: i64, data: T) -> Self {
        Self::from_data(aggregate_id, sequence_number, Arc::new(data))
    }

    /// Create a snapshot of aggregate state as of `sequence_number`.
    ///
    /// Replay resumes with the first event after `sequence_number`.
    pub fn snapshot<T: EventType>(aggregate_id: Uuid, sequence_number: i64, state: T) -> Self {
        Self {
            snapshot: true,
            ..Self::new(aggregate_id, sequence_number, state)
        }
    }

    /// Create an event from an already type-erased payload
    pub fn from_data(aggregate_id: Uuid, sequence_number: i64, data: Arc<dyn EventData>) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            // Postgres keeps microseconds; truncate so stored and in-memory
            // timestamps compare equal.
            created_at: Utc::now().trunc_subsecs(6),
            position: None,
            snapshot: false,
            data,
        }
    }

    /// Rebuild an event from a stored row
    pub(crate) fn restore(
        aggregate_id: Uuid,
        sequence_number: i64,
        created_at: DateTime<Utc>,
        position: Option<i64>,
        snapshot: bool,
        data: Arc<dyn EventData>,
    ) -> Self {
        Self {
            aggregate_id,
            sequence_number,
            created_at,
            position,
            snapshot,
            data,
        }
    }

    /// Override the creation timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub(crate) fn with_position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn aggregate_id(&self) -> Uuid {
        self.aggregate_id
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Global insertion order assigned by storage (`None` until stored,
    /// always `None` for snapshots)
    pub fn position(&self) -> Option<i64> {
        self.position
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    pub fn type_tag(&self) -> &'static str {
        self.data.type_tag()
    }

    pub fn data(&self) -> &dyn EventData {
        self.data.as_ref()
    }

    /// Borrow the payload as `T` if this event carries a `T`
    pub fn payload<T: EventType>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref::<T>()
    }
}
