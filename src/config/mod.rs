//! Configuration management for mediaferry
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use mediaferry::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Status endpoint on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `MEDIAFERRY__<section>__<key>`
//!
//! Examples:
//! - `MEDIAFERRY__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `MEDIAFERRY__QUEUE__MAX_RETRIES=5`
//! - `MEDIAFERRY__PROTOCOLS__MAX_BUFFER_BYTES=256MB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/mediaferry.toml`.
//! This can be overridden using the `MEDIAFERRY_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{Config, ProtocolsConfig, QueueConfig, ServerConfig, StoreConfig, ToolsConfig};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`MEDIAFERRY__*`)
    /// 2. TOML file (default: `config/mediaferry.toml`)
    /// 3. Default values
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");
        fs::write(&config_path, "[store]\npath = \"/tmp/jobs\"\n").unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.store.path.to_str(), Some("/tmp/jobs"));
    }

    #[test]
    fn test_validation_catches_unknown_tool() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");
        fs::write(&config_path, "[tools.capacity]\ntranscode = 2\n").unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::UnknownTool { .. })
        ));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let sample = include_str!("../../config/mediaferry.toml");
        let parsed: toml::Value = toml::from_str(sample).unwrap();
        assert!(parsed.get("queue").is_some());

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("mediaferry.toml");
        fs::write(&config_path, sample).unwrap();
        assert!(Config::load_from_path(config_path).is_ok());
    }
}
