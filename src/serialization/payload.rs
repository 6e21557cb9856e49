//! Event payload traits

use std::any::Any;
use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

/// A concrete event (or snapshot state) type stored under a fixed tag.
///
/// The tag is what ends up in the `event_type` / `snapshot_type` columns,
/// so it must stay stable once events of that type have been written.
pub trait EventType: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Stable type tag used for storage and registry lookup
    const TYPE_TAG: &'static str;
}

/// Object-safe view of an [`EventType`].
///
/// Events of different types travel together through commits, loads and
/// publication as `Arc<dyn EventData>`. Handlers get the concrete type back
/// through [`crate::domain::Event::payload`].
pub trait EventData: Debug + Send + Sync + 'static {
    fn type_tag(&self) -> &'static str;

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: EventType> EventData for T {
    fn type_tag(&self) -> &'static str {
        T::TYPE_TAG
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
