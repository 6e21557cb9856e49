//! Event Store module
//!
//! Persistence layer for Event Sourcing: commits, history loading,
//! snapshots and cursor replay over a pluggable storage backend.

mod error;
mod memory;
mod postgres;
mod replay;
mod repository;
mod storage;

pub use error::EventStoreError;
pub use memory::{InMemoryStorage, InMemoryTransaction};
pub use postgres::{PostgresStorage, PostgresTransaction};
pub use replay::{ReplayProgress, ReplayQuery};
pub use repository::{CommitReceipt, EventStore};
pub use storage::{
    DuplicateKey, EventStorage, NewEventRecord, StorageError, StorageTransaction, StoredEvent,
    StoredHistory, StoredSnapshot,
};
