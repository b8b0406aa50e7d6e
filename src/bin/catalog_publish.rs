//! catalog-publish: publish one test message to an ingestion queue
//!
//! Declares the queue with the same topology the service uses (including its
//! dead-letter queue) and publishes a persistent JSON message. Without
//! `--file` a valid sample payload for the chosen collection is generated.

use std::error::Error;

use chrono::{Months, Utc};
use clap::Parser;
use serde_json::{json, Value};
use uuid::Uuid;

use catalog_ingest::broker::{queue_topology, AmqpBroker, Broker};
use catalog_ingest::config::Config;
use catalog_ingest::validation::Collection;

#[derive(Parser)]
#[command(name = "catalog-publish")]
#[command(about = "Publish a test message to a catalog-ingest queue", long_about = None)]
struct Cli {
    /// Collection whose queue receives the message
    #[arg(short, long, default_value = "products", value_parser = parse_collection)]
    queue: Collection,

    /// Product code for the sample payload (default: random)
    #[arg(short, long)]
    product_code: Option<String>,

    /// Publish this JSON file instead of a sample payload
    #[arg(short, long)]
    file: Option<String>,

    /// Broker URL (default: built from configuration)
    #[arg(short, long, env = "INGEST_AMQP_URL")]
    url: Option<String>,

    /// Configuration file for queue names and broker settings
    #[arg(short, long)]
    config: Option<String>,

    /// Message id property
    #[arg(short, long)]
    message_id: Option<String>,
}

fn parse_collection(name: &str) -> Result<Collection, String> {
    name.parse::<Collection>().map_err(|e| e.to_string())
}

fn sample_message(collection: Collection, product_code: &str) -> Value {
    let now = Utc::now();
    match collection {
        Collection::Products => json!({
            "product_code": product_code,
            "collection": "products",
            "name": format!("Test Product {}", product_code),
            "description": "This is a test product",
            "category": "Test Category",
            "brand": "TestBrand",
            "price": 99.99,
            "currency": "USD",
            "sku": format!("SKU-{}", product_code),
            "created_at": now.to_rfc3339(),
            "updated_at": now.to_rfc3339(),
        }),
        Collection::Stocks => json!({
            "product_code": product_code,
            "collection": "stocks",
            "quantity": 100,
            "warehouse_id": "WH-MAIN",
            "location": "A1-B2-C3",
            "updated_at": now.to_rfc3339(),
        }),
        Collection::Prices => {
            let expires = now.checked_add_months(Months::new(12)).unwrap_or(now);
            json!({
                "product_code": product_code,
                "collection": "prices",
                "currency": "USD",
                "base_price": 99.99,
                "discount_percentage": 10.0,
                "final_price": 89.99,
                "effective_date": now.to_rfc3339(),
                "expires_at": expires.to_rfc3339(),
                "promotion_id": null,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let body = match &cli.file {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str::<Value>(&text)?;
            text.into_bytes()
        }
        None => {
            let product_code = cli.product_code.clone().unwrap_or_else(|| {
                let id = Uuid::new_v4().simple().to_string();
                format!("TEST-{}", id[..8].to_uppercase())
            });
            serde_json::to_vec_pretty(&sample_message(cli.queue, &product_code))?
        }
    };

    let queue = config.broker.queues.queue_for(cli.queue);
    let url = cli.url.clone().unwrap_or_else(|| config.broker.url());

    println!("Publishing to queue '{}':", queue);
    println!("{}", String::from_utf8_lossy(&body));

    let broker = AmqpBroker::new(
        url,
        config.broker.heartbeat(),
        config.broker.blocked_connection_timeout(),
    );
    let channel = broker.connect().await?;

    let topology = queue_topology(
        queue,
        &config.broker.dlq_suffix,
        config.broker.dlq_message_ttl(),
    );
    for spec in &topology {
        channel.declare_queue(spec).await?;
    }

    let published = channel
        .publish(queue, &body, cli.message_id.as_deref())
        .await;
    channel.close().await?;
    published?;

    println!("Message published");
    Ok(())
}
