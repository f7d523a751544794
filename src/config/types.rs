//! Configuration types for tcp-redirect
//!
//! Configuration is loaded from a JSON file and validated at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Redirect listener configuration
    #[serde(default)]
    pub listen: ListenConfig,

    /// Per-session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen.validate()?;
        self.session.validate()?;
        self.log.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

/// Listen configuration for the redirect inbound
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Listen address as `host:port`; the host may be a name
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Enable `SO_REUSEPORT`
    #[serde(default)]
    pub reuse_port: bool,
}

impl ListenConfig {
    /// Validate listen configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty or portless
    /// address, or a zero backlog.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err(ConfigError::ValidationError(
                "listen.address must not be empty".into(),
            ));
        }

        let port_ok = address
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        if !port_ok {
            return Err(ConfigError::ValidationError(format!(
                "listen.address must be host:port, got '{address}'"
            )));
        }

        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "listen.backlog must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            backlog: default_backlog(),
            reuse_port: false,
        }
    }
}

/// Per-session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Idle timeout for the copy phase, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Upstream connect timeout, in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// `SO_MARK` applied to upstream sockets, so redirect rules can skip them
    #[serde(default)]
    pub routing_mark: Option<u32>,

    /// Keep forwarding the other direction after one side sends EOF
    #[serde(default)]
    pub half_close: bool,
}

impl SessionConfig {
    /// Validate session configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if a timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session.idle_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "session.connect_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get idle timeout as Duration
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get connect timeout as Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            routing_mark: None,
            half_close: false,
        }
    }
}

/// Accepted `log.level` values, matched case-insensitively
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown level or format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "log.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.level
            )));
        }

        match self.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "log.format must be 'json' or 'text', got '{other}'"
            ))),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

// Default value functions for serde

const fn default_true() -> bool {
    true
}

fn default_listen_address() -> String {
    "0.0.0.0:7892".into()
}

const fn default_backlog() -> u32 {
    1024
}

const fn default_idle_timeout_secs() -> u64 {
    300
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
