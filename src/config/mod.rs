//! Application configuration.
//!
//! Aggregates the broker, store, API and logging sections into a single
//! `Config` that is loaded from YAML files and environment variables.

mod messaging;
mod server;
mod storage;

pub use messaging::{BrokerConfig, QueueNames};
pub use server::{ApiConfig, ConfigError, LogFormat, LoggingConfig};
pub use storage::StoreConfig;

use std::time::Duration;

use serde::Deserialize;

use crate::validation::Collection;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "INGEST_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "INGEST";
/// Environment variable for the log filter.
pub const LOG_ENV_VAR: &str = "INGEST_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    /// How long teardown waits for consumers to stop.
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            store: StoreConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__`
    ///    separator, e.g. `INGEST__BROKER__HOST`
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

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the consumers or API cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.max_connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "broker.max_connect_attempts must be at least 1".to_string(),
            ));
        }
        if broker.dlq_suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "broker.dlq_suffix must not be empty".to_string(),
            ));
        }
        for collection in Collection::ALL {
            if broker.queues.queue_for(collection).is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "broker.queues.{} must not be empty",
                    collection
                )));
            }
        }
        if self.store.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "store.connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
