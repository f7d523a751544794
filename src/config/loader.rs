//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: listen={}, idle_timeout={}s",
        config.listen.address, config.session.idle_timeout_secs
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TCP_REDIRECT_LISTEN_ADDR`: Override listen address
/// - `TCP_REDIRECT_LOG_LEVEL`: Override log level
/// - `TCP_REDIRECT_IDLE_TIMEOUT_SECS`: Override session idle timeout
/// - `TCP_REDIRECT_ROUTING_MARK`: Override upstream routing mark
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides from a variable lookup, then re-validate
fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(addr) = lookup("TCP_REDIRECT_LISTEN_ADDR") {
        config.listen.address = addr;
        debug!("Listen address overridden to {}", config.listen.address);
    }

    if let Some(level) = lookup("TCP_REDIRECT_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(secs) = lookup("TCP_REDIRECT_IDLE_TIMEOUT_SECS") {
        config.session.idle_timeout_secs = secs.parse().map_err(|_| ConfigError::EnvError {
            name: "TCP_REDIRECT_IDLE_TIMEOUT_SECS".into(),
            reason: format!("Invalid number: {secs}"),
        })?;
        debug!(
            "Idle timeout overridden to {}s",
            config.session.idle_timeout_secs
        );
    }

    if let Some(mark) = lookup("TCP_REDIRECT_ROUTING_MARK") {
        config.session.routing_mark = Some(parse_mark(&mark).ok_or_else(|| {
            ConfigError::EnvError {
                name: "TCP_REDIRECT_ROUTING_MARK".into(),
                reason: format!("Invalid mark: {mark}"),
            }
        })?);
        debug!("Routing mark overridden to {:?}", config.session.routing_mark);
    }

    config.validate()
}

/// Parse a decimal or `0x`-prefixed hexadecimal mark
fn parse_mark(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
