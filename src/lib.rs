//! stream_ledger
//!
//! Event-sourcing store: an append-only log of domain events grouped into
//! per-aggregate streams, with optimistic concurrency control, snapshots and
//! synchronous publication of committed events to registered handlers.

pub mod config;
pub mod db;
pub mod domain;
pub mod event_store;
pub mod jobs;
pub mod projection;
pub mod serialization;

pub use config::{Config, ConfigError, EventStoreConfig};
pub use domain::{Command, Event, EventStream, StoredCommand};
pub use event_store::{
    CommitReceipt, EventStorage, EventStore, EventStoreError, InMemoryStorage, PostgresStorage,
    ReplayProgress, ReplayQuery,
};
pub use projection::{EventHandler, EventPublisher, PublishEventError};
pub use serialization::{EventData, EventType, EventTypeRegistry};
