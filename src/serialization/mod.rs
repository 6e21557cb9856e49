//! Serialization module
//!
//! Converts between typed event payloads and the `(type_tag, payload)`
//! pairs the storage layer persists.

mod payload;
mod registry;

pub use payload::{EventData, EventType};
pub use registry::{EventTypeRegistry, RegistryError, SerializationError, SerializedEvent};
