//! Event Stream
//!
//! Metadata identifying one aggregate's history.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One aggregate's stream of events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStream {
    /// Aggregate type tag (e.g. "Account")
    pub aggregate_type: String,

    /// Aggregate ID, unique across all streams
    pub aggregate_id: Uuid,

    /// Events since the latest snapshot that make the aggregate a snapshot candidate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_threshold: Option<i32>,

    /// Age after which the latest snapshot is considered outdated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_outdated_after: Option<Duration>,
}

impl EventStream {
    pub fn new(aggregate_type: impl Into<String>, aggregate_id: Uuid) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            snapshot_threshold: None,
            snapshot_outdated_after: None,
        }
    }

    pub fn with_snapshot_threshold(mut self, threshold: i32) -> Self {
        self.snapshot_threshold = Some(threshold);
        self
    }

    pub fn with_snapshot_outdated_after(mut self, outdated_after: Duration) -> Self {
        self.snapshot_outdated_after = Some(outdated_after);
        self
    }
}
