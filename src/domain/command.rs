//! Commands
//!
//! The intent that caused a batch of events, recorded for audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Command to be recorded alongside the events it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
}

impl Command {
    /// Create a command from any serializable payload
    pub fn new<C: Serialize>(
        command_type: &str,
        aggregate_id: Uuid,
        payload: &C,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self {
            command_type: command_type.to_string(),
            aggregate_id,
            payload,
        })
    }
}

/// Command as stored by the persistence layer
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCommand {
    pub id: i64,
    pub command_type: String,
    pub aggregate_id: Uuid,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
