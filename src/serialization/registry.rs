//! Event Type Registry
//!
//! Explicit `type_tag -> decoder` table, built once at startup and shared
//! read-only by the event store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{EventData, EventType};

/// Decodes a stored JSON payload into a live typed instance
type Decoder = fn(serde_json::Value) -> Result<Arc<dyn EventData>, serde_json::Error>;

/// Event payload in its storage form
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedEvent {
    pub type_tag: String,
    pub payload: serde_json::Value,
}

/// Errors raised while building the registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Type tag registered twice: {0}")]
    DuplicateTypeTag(&'static str),
}

/// Errors raised while converting payloads
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("No event type registered for tag: {0}")]
    UnknownTypeTag(String),

    #[error("Invalid payload for {type_tag}: {source}")]
    Payload {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },
}

fn decode_as<T: EventType>(
    payload: serde_json::Value,
) -> Result<Arc<dyn EventData>, serde_json::Error> {
    let event: T = serde_json::from_value(payload)?;
    Ok(Arc::new(event))
}

/// Registry of every event and snapshot type the store can rehydrate
#[derive(Clone, Default)]
pub struct EventTypeRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl EventTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type under its [`EventType::TYPE_TAG`]
    pub fn register<T: EventType>(&mut self) -> Result<&mut Self, RegistryError> {
        if self.decoders.contains_key(T::TYPE_TAG) {
            return Err(RegistryError::DuplicateTypeTag(T::TYPE_TAG));
        }
        self.decoders.insert(T::TYPE_TAG, decode_as::<T> as Decoder);
        Ok(self)
    }

    /// Builder-style variant of [`register`](Self::register)
    pub fn with<T: EventType>(mut self) -> Result<Self, RegistryError> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Turn a stored `(type_tag, payload)` pair back into a typed instance
    pub fn decode(
        &self,
        type_tag: &str,
        payload: serde_json::Value,
    ) -> Result<Arc<dyn EventData>, SerializationError> {
        let decoder = self
            .decoders
            .get(type_tag)
            .ok_or_else(|| SerializationError::UnknownTypeTag(type_tag.to_string()))?;

        decoder(payload).map_err(|source| SerializationError::Payload {
            type_tag: type_tag.to_string(),
            source,
        })
    }

    /// Turn a typed instance into its storage form.
    ///
    /// Encoding needs no lookup: the tag travels with the value.
    pub fn encode(data: &dyn EventData) -> Result<SerializedEvent, SerializationError> {
        let payload = data.to_json().map_err(|source| SerializationError::Payload {
            type_tag: data.type_tag().to_string(),
            source,
        })?;

        Ok(SerializedEvent {
            type_tag: data.type_tag().to_string(),
            payload,
        })
    }
}

impl fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&&'static str> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("EventTypeRegistry")
            .field("type_tags", &tags)
            .finish()
    }
}
