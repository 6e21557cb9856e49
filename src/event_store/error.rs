//! Event Store Errors
//!
//! Error types for event store operations.

use crate::projection::PublishEventError;
use crate::serialization::SerializationError;

use super::StorageError;

/// Errors that can occur in the event store
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    /// Another writer already claimed one of the `(aggregate_id, sequence_number)` keys
    #[error("Optimistic locking conflict: {source}")]
    OptimisticLocking {
        #[source]
        source: StorageError,
    },

    /// An event handler failed; the commit was rolled back
    #[error(transparent)]
    PublishEvent(#[from] PublishEventError),

    /// Caller supplied an invalid argument or an empty query range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Storage failure other than a uniqueness conflict
    #[error("Storage error: {0}")]
    Storage(#[source] StorageError),
}

impl From<StorageError> for EventStoreError {
    fn from(error: StorageError) -> Self {
        if error.is_unique_violation() {
            EventStoreError::OptimisticLocking { source: error }
        } else {
            EventStoreError::Storage(error)
        }
    }
}

impl EventStoreError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        EventStoreError::InvalidArgument(message.into())
    }

    /// Check if this error is a concurrency conflict
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, EventStoreError::OptimisticLocking { .. })
    }

    /// Check if reloading the aggregate and retrying the command may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EventStoreError::OptimisticLocking { .. } | EventStoreError::Storage(_)
        )
    }
}
