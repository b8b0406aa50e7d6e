//! Document store configuration.

use std::time::Duration;

use serde::Deserialize;

/// MongoDB connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    /// Total connection attempts made by one `connect()` call.
    pub connect_attempts: usize,
    pub connect_retry_delay_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017/data_ingestion".to_string(),
            database: "data_ingestion".to_string(),
            connect_attempts: 5,
            connect_retry_delay_secs: 5,
        }
    }
}

impl StoreConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }
}
