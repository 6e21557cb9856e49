//! Projection module
//!
//! Event handlers (projections) and the publisher that feeds them committed
//! events. Read-model logic itself lives in the handlers, outside this crate.

mod handler;
mod publisher;

pub use handler::EventHandler;
pub use publisher::{EventPublisher, PublishEventError};
