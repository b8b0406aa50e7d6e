//! Message broker access for consumers.
//!
//! This module contains:
//! - `Broker` trait: opens a channel on a fresh broker connection
//! - `BrokerChannel` trait: the per-channel operations a consumer relies on
//!   (queue declaration, prefetch, consume, ack/reject, cancel, close)
//! - Queue topology helpers (main queue + dead-letter queue)
//! - Implementations: AMQP (RabbitMQ), Mock

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpChannel};
pub use mock::{MockBroker, Outcome};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Failed to declare queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Channel is closed")]
    ChannelClosed,
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned token identifying this delivery for ack/reject.
    pub delivery_tag: u64,
    /// Producer-assigned message id, if any.
    pub message_id: Option<String>,
    /// Queue the message was consumed from.
    pub queue: String,
    pub body: Vec<u8>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer registration.
///
/// An `Err` item or the end of the stream means the channel is no longer usable.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Declaration parameters for a durable queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Per-queue message TTL (`x-message-ttl`).
    pub message_ttl: Option<Duration>,
    /// Routing key for rejected messages on the default exchange
    /// (`x-dead-letter-exchange = ""`, `x-dead-letter-routing-key`).
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    /// A dead-letter queue: durable, messages expire after `ttl`.
    pub fn dead_letter(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: Some(ttl),
            dead_letter_routing_key: None,
        }
    }

    /// A work queue whose rejected messages are routed to `dead_letter_queue`.
    pub fn with_dead_letter(name: impl Into<String>, dead_letter_queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl: None,
            dead_letter_routing_key: Some(dead_letter_queue.into()),
        }
    }
}

/// Build the dead-letter queue name for a queue.
pub fn dead_letter_queue_name(queue: &str, suffix: &str) -> String {
    format!("{}{}", queue, suffix)
}

/// Declarations for a queue and its dead-letter queue, in declaration order.
///
/// The dead-letter queue comes first so the main queue's routing target exists.
pub fn queue_topology(queue: &str, dlq_suffix: &str, dlq_ttl: Duration) -> [QueueSpec; 2] {
    let dlq = dead_letter_queue_name(queue, dlq_suffix);
    [
        QueueSpec::dead_letter(dlq.clone(), dlq_ttl),
        QueueSpec::with_dead_letter(queue, dlq),
    ]
}

/// Opens broker channels.
///
/// Every call opens a new connection; the returned channel owns it and closes
/// it on `close()`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>>;
}

/// Operations on one open channel.
///
/// Declarations are idempotent. `close()` may be called on an already closed
/// channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Cap the number of unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Register a consumer on `queue` and return its deliveries.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Reject a delivery. Without requeue the broker dead-letters it.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Publish a persistent message to `queue` via the default exchange.
    async fn publish(&self, queue: &str, body: &[u8], message_id: Option<&str>) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_queue_name() {
        assert_eq!(dead_letter_queue_name("products", ".dlq"), "products.dlq");
    }

    #[test]
    fn test_queue_topology_declares_dlq_first() {
        let week = Duration::from_secs(7 * 24 * 60 * 60);
        let [dlq, main] = queue_topology("stocks", ".dlq", week);

        assert_eq!(dlq.name, "stocks.dlq");
        assert!(dlq.durable);
        assert_eq!(dlq.message_ttl, Some(week));
        assert_eq!(dlq.dead_letter_routing_key, None);

        assert_eq!(main.name, "stocks");
        assert!(main.durable);
        assert_eq!(main.message_ttl, None);
        assert_eq!(main.dead_letter_routing_key.as_deref(), Some("stocks.dlq"));
    }
}
