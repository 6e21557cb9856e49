//! Domain module
//!
//! Data model of the event store: streams, events, snapshots and commands.

pub mod command;
pub mod events;
pub mod stream;

pub use command::{Command, StoredCommand};
pub use events::Event;
pub use stream::EventStream;
