//! Bus configuration.
//!
//! Loaded from YAML files and environment variables. Exchange descriptors
//! listed under `exchanges` override the ones registered in code, keyed by
//! event name.

mod messaging;

pub use messaging::{AmqpConfig, ConsumerConfig, RetryConfig};

use std::collections::HashMap;

use serde::Deserialize;

use crate::bus::ExchangeDescriptor;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "rabbitbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RABBITBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RABBITBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RABBITBUS_LOG";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Main bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker connection.
    pub amqp: AmqpConfig,
    /// Resilience policy.
    pub retry: RetryConfig,
    /// Consumer settings.
    pub consumer: ConsumerConfig,
    /// Exchange descriptor overrides by event name.
    pub exchanges: HashMap<String, ExchangeDescriptor>,
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `rabbitbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Override for an event name. Keys compare case-insensitively since
    /// the config loader lowercases them.
    pub fn exchange_override(&self, event_name: &str) -> Option<&ExchangeDescriptor> {
        self.exchanges
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(event_name))
            .map(|(_, descriptor)| descriptor)
    }
}
