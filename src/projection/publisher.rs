//! Event Publisher
//!
//! Delivers committed events to every registered handler, in order, inside
//! the caller's transaction.

use std::fmt;
use std::sync::Arc;

use crate::domain::Event;

use super::EventHandler;

/// A handler failed while an event was being published
#[derive(Debug, thiserror::Error)]
#[error(
    "Event handler {event_handler} failed on {} event {}#{}: {cause}",
    .event.type_tag(),
    .event.aggregate_id(),
    .event.sequence_number()
)]
pub struct PublishEventError {
    /// The event being dispatched when the handler failed
    pub event: Event,

    /// Name of the failing handler
    pub event_handler: String,

    #[source]
    pub cause: anyhow::Error,
}

/// Synchronous, in-process event publisher
#[derive(Clone, Default)]
pub struct EventPublisher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventPublisher {
    /// Create a publisher dispatching to `handlers` in the given order
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self { handlers }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// Publish `events` to every interested handler.
    ///
    /// Events are dispatched in slice order; for each event, handlers are
    /// invoked in registration order. The first failure stops dispatch.
    pub async fn publish(&self, events: &[Event]) -> Result<(), PublishEventError> {
        for event in events {
            for handler in &self.handlers {
                if !handler.handles(event.type_tag()) {
                    continue;
                }

                if let Err(cause) = handler.handle_event(event).await {
                    tracing::warn!(
                        handler = handler.name(),
                        aggregate_id = %event.aggregate_id(),
                        sequence_number = event.sequence_number(),
                        event_type = event.type_tag(),
                        error = %cause,
                        "Event handler failed"
                    );
                    return Err(PublishEventError {
                        event: event.clone(),
                        event_handler: handler.name().to_string(),
                        cause,
                    });
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("handlers", &self.handler_names())
            .finish()
    }
}
