//! Event Handler contract

use async_trait::async_trait;

use crate::domain::Event;

/// A consumer of committed events.
///
/// Handlers run inline with the commit that produced the event: an error
/// returned here rolls the whole commit back.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name reported in [`super::PublishEventError`] when this handler fails
    fn name(&self) -> &str;

    /// Whether this handler has a callback for events with `type_tag`
    fn handles(&self, _type_tag: &str) -> bool {
        true
    }

    async fn handle_event(&self, event: &Event) -> anyhow::Result<()>;
}
