//! Pool configuration.
//!
//! [`PoolConfig`] gathers every tunable of the connection pool into one
//! serde structure that round-trips through TOML. Missing sections and
//! fields fall back to their defaults, so a config file only needs the
//! values it changes:
//!
//! ```toml
//! [connection]
//! max_attempts = 5
//!
//! [operations.read_history_entry]
//! timeout_ms = 4000
//! max_retries = 3
//!
//! [history]
//! batch_size = 10
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::history::HistoryConfig;
use crate::link::LinkConfig;
use crate::operation::{OperationKind, OperationPolicies};
use crate::reconnect::ReconnectOptions;
use crate::retry::RetryConfig;
use crate::sequencer::BatchPacing;

/// The `history` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    #[serde(flatten)]
    pub session: HistoryConfig,
    #[serde(flatten)]
    pub pacing: BatchPacing,
    /// Pause between a command write and the read that depends on it, in milliseconds.
    pub write_settle_ms: u64,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            session: HistoryConfig::default(),
            pacing: BatchPacing::default(),
            write_settle_ms: 100,
        }
    }
}

/// The `auth` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Deadline of one handshake round, in milliseconds.
    pub deadline_ms: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self { deadline_ms: 4_000 }
    }
}

/// The `events` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Broadcast channel capacity. Slow subscribers lag past this.
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Configuration of a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub connection: ReconnectOptions,
    pub operations: OperationPolicies,
    pub retry: RetryConfig,
    pub history: HistorySettings,
    pub auth: AuthSettings,
    pub events: EventSettings,
}

impl PoolConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tight timeouts and short delays, for tests and strong signal.
    pub fn fast() -> Self {
        Self {
            connection: ReconnectOptions::fast(),
            operations: OperationPolicies::fast(),
            retry: RetryConfig::default().initial_delay(Duration::from_millis(500)),
            history: HistorySettings {
                pacing: BatchPacing {
                    batch_size: 20,
                    pause_ms: 250,
                },
                write_settle_ms: 50,
                ..Default::default()
            },
            auth: AuthSettings { deadline_ms: 2_000 },
            events: EventSettings::default(),
        }
    }

    /// Long timeouts, more retries and growing delays for weak signal.
    pub fn challenging_environment() -> Self {
        Self {
            connection: ReconnectOptions::challenging_environment(),
            operations: OperationPolicies::challenging_environment(),
            retry: RetryConfig::backoff(),
            history: HistorySettings {
                pacing: BatchPacing {
                    batch_size: 10,
                    pause_ms: 2_000,
                },
                write_settle_ms: 200,
                ..Default::default()
            },
            auth: AuthSettings::default(),
            events: EventSettings::default(),
        }
    }

    /// Set the connection section.
    #[must_use]
    pub fn connection(mut self, connection: ReconnectOptions) -> Self {
        self.connection = connection;
        self
    }

    /// Set the operation budgets.
    #[must_use]
    pub fn operations(mut self, operations: OperationPolicies) -> Self {
        self.operations = operations;
        self
    }

    /// Set the retry delays.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the history section.
    #[must_use]
    pub fn history(mut self, history: HistorySettings) -> Self {
        self.history = history;
        self
    }

    /// Check every section and report the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.retry.validate()?;

        for kind in OperationKind::ALL {
            if self.operations.get(kind).timeout_ms == 0 {
                return Err(Error::invalid_config(format!(
                    "operations.{}.timeout_ms must be > 0",
                    kind
                )));
            }
        }

        let history = &self.history;
        if history.session.checkpoint_interval == 0 {
            return Err(Error::invalid_config(
                "history.checkpoint_interval must be > 0",
            ));
        }
        if history.session.max_consecutive_failures == 0 {
            return Err(Error::invalid_config(
                "history.max_consecutive_failures must be > 0",
            ));
        }
        if history.pacing.batch_size > 0 && history.pacing.pause_ms == 0 {
            return Err(Error::invalid_config(
                "history.pause_ms must be > 0 when batching is enabled",
            ));
        }
        if self.auth.deadline_ms == 0 {
            return Err(Error::invalid_config("auth.deadline_ms must be > 0"));
        }
        if self.events.capacity == 0 {
            return Err(Error::invalid_config("events.capacity must be > 0"));
        }
        Ok(())
    }

    /// Parse a TOML document and validate it.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::invalid_config(e.to_string()))
    }

    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Settings for each device link.
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            policies: self.operations.clone(),
            retry: self.retry.clone(),
            pacing: self.history.pacing,
            history: self.history.session.clone(),
            write_settle: Duration::from_millis(self.history.write_settle_ms),
            auth_deadline: Duration::from_millis(self.auth.deadline_ms),
        }
    }
}
