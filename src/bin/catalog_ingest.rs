//! catalog-ingest: queue-to-document-store ingestion service
//!
//! Consumes product, stock and price updates from RabbitMQ, validates them and
//! stores them in MongoDB. Also serves the read-only query API.
//!
//! ## Architecture
//! ```text
//! [RabbitMQ: products|stocks|prices] -> [consumer per queue] -> [MongoDB]
//!              |                                                   ^
//!              v (invalid)                                         |
//!        [<queue>.dlq]                          [Query API (axum)] -+
//! ```
//!
//! ## Configuration
//! - `config.yaml`, a path given as first argument / `--config`, or `INGEST_CONFIG`
//! - `INGEST__<SECTION>__<KEY>` environment overrides
//! - `INGEST_LOG`: tracing filter

use std::sync::Arc;

use tracing::{error, info};

use catalog_ingest::broker::AmqpBroker;
use catalog_ingest::config::Config;
use catalog_ingest::store::MongoStore;
use catalog_ingest::supervisor::Supervisor;
use catalog_ingest::utils::bootstrap::{init_tracing, parse_config_path, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;

    init_tracing(&config.logging);
    info!(
        broker_host = %config.broker.host,
        broker_port = config.broker.port,
        database = %config.store.database,
        "Starting catalog-ingest"
    );

    let broker = Arc::new(AmqpBroker::new(
        config.broker.url(),
        config.broker.heartbeat(),
        config.broker.blocked_connection_timeout(),
    ));
    let store = Arc::new(MongoStore::from_config(&config.store));

    Supervisor::new(config, broker, store)
        .run(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "catalog-ingest failed to start");
            e
        })?;

    Ok(())
}
