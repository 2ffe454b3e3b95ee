//! Configuration management for the command orchestrator
//!
//! Supports loading configuration from:
//! - TOML/YAML files
//! - Environment variables (ORCHESTRATOR_ prefix, `__` separator)
//! - Runtime overrides applied by the CLI

pub mod settings;

pub use settings::{
    load_settings, MqttConfig, PersistenceBackend, PersistenceConfig, PipelineConfig,
    RegistryConfig, RetryConfig, ServerConfig, SessionConfig, Settings,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}
