//! Configuration module
//!
//! Loads process configuration from environment variables and defines the
//! immutable configuration value held by an [`crate::EventStore`].

use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::projection::EventHandler;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidValue("ENVIRONMENT")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Deployment environment
    pub environment: Environment,

    /// Skip event handler dispatch on commit and replay
    pub disable_event_handlers: bool,

    /// Maximum aggregates reported per snapshot-candidate query
    pub snapshot_candidate_limit: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = lookup("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let environment = lookup("ENVIRONMENT")
            .unwrap_or_else(|| "development".to_string())
            .parse()?;

        let disable_event_handlers = lookup("EVENT_STORE_DISABLE_EVENT_HANDLERS")
            .unwrap_or_else(|| "false".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("EVENT_STORE_DISABLE_EVENT_HANDLERS"))?;

        let snapshot_candidate_limit = lookup("SNAPSHOT_CANDIDATE_LIMIT")
            .unwrap_or_else(|| "100".to_string())
            .parse()
            .ok()
            .filter(|limit: &usize| *limit > 0)
            .ok_or(ConfigError::InvalidValue("SNAPSHOT_CANDIDATE_LIMIT"))?;

        Ok(Self {
            database_url,
            database_max_connections,
            environment,
            disable_event_handlers,
            snapshot_candidate_limit,
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Base event store configuration (no handlers registered)
    pub fn event_store_config(&self) -> EventStoreConfig {
        EventStoreConfig::new().disable_event_handlers(self.disable_event_handlers)
    }
}

/// Configuration held by an event store.
///
/// The value is immutable once handed to the store; reconfiguring means
/// building a new value and calling [`crate::EventStore::with_config`], which
/// replaces the previous configuration wholesale.
#[derive(Clone, Default)]
pub struct EventStoreConfig {
    /// Skip publication to event handlers
    pub disable_event_handlers: bool,

    /// Handlers invoked on publish, in order
    pub event_handlers: Vec<Arc<dyn EventHandler>>,

    /// Snapshot type tags accepted by `store_snapshots`; empty accepts any
    pub snapshot_type_tags: Vec<String>,
}

impl EventStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable_event_handlers(mut self, disable: bool) -> Self {
        self.disable_event_handlers = disable;
        self
    }

    /// Append a handler to the dispatch order
    pub fn with_event_handler<H>(mut self, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
        self
    }

    /// Append an already shared handler to the dispatch order
    pub fn with_shared_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    pub fn with_snapshot_type_tag(mut self, type_tag: impl Into<String>) -> Self {
        self.snapshot_type_tags.push(type_tag.into());
        self
    }

    /// Whether `store_snapshots` accepts snapshots tagged `type_tag`
    pub fn accepts_snapshot_type(&self, type_tag: &str) -> bool {
        self.snapshot_type_tags.is_empty()
            || self.snapshot_type_tags.iter().any(|tag| tag == type_tag)
    }
}

impl fmt::Debug for EventStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers: Vec<&str> = self.event_handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("EventStoreConfig")
            .field("disable_event_handlers", &self.disable_event_handlers)
            .field("event_handlers", &handlers)
            .field("snapshot_type_tags", &self.snapshot_type_tags)
            .finish()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
