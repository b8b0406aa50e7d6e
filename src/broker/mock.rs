//! In-memory broker for testing.
//!
//! Models the parts of RabbitMQ the consumer depends on: durable queues with
//! dead-letter routing, per-channel prefetch, manual ack/reject with requeue,
//! and connection loss. Connection failures can be scripted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Broker, BrokerChannel, BrokerError, Delivery, DeliveryStream, QueueSpec, Result};

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked {
        queue: String,
        body: Vec<u8>,
    },
    Rejected {
        queue: String,
        body: Vec<u8>,
        requeue: bool,
    },
}

impl Outcome {
    pub fn queue(&self) -> &str {
        match self {
            Outcome::Acked { queue, .. } | Outcome::Rejected { queue, .. } => queue,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Outcome::Acked { .. })
    }
}

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

#[derive(Default)]
struct Queue {
    spec: Option<QueueSpec>,
    ready: VecDeque<Message>,
}

struct Registration {
    channel_id: u64,
    tag: String,
    queue: String,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct ChannelState {
    open: Arc<AtomicBool>,
    prefetch: u16,
    unacked: HashMap<u64, (String, Message)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

#[derive(Default)]
struct State {
    fail_next_connects: usize,
    fail_all_connects: bool,
    connect_times: Vec<Instant>,
    queues: HashMap<String, Queue>,
    channels: HashMap<u64, ChannelState>,
    registrations: Vec<Registration>,
    outcomes: Vec<Outcome>,
    cancelled: Vec<String>,
    next_channel_id: u64,
    next_delivery_tag: u64,
}

impl State {
    /// Hand ready messages to registered consumers within their prefetch window.
    fn dispatch(&mut self) {
        let mut index = 0;
        while index < self.registrations.len() {
            let reg = &self.registrations[index];
            let (channel_id, queue_name) = (reg.channel_id, reg.queue.clone());
            let mut receiver_gone = false;

            loop {
                let Some(channel) = self.channels.get_mut(&channel_id) else {
                    break;
                };
                if !channel.open.load(Ordering::SeqCst) || !channel.has_capacity() {
                    break;
                }
                let Some(message) = self
                    .queues
                    .get_mut(&queue_name)
                    .and_then(|q| q.ready.pop_front())
                else {
                    break;
                };

                self.next_delivery_tag += 1;
                let delivery = Delivery {
                    delivery_tag: self.next_delivery_tag,
                    message_id: message.message_id.clone(),
                    queue: queue_name.clone(),
                    body: message.body.clone(),
                    redelivered: message.redelivered,
                };

                if self.registrations[index].sender.send(Ok(delivery)).is_err() {
                    if let Some(queue) = self.queues.get_mut(&queue_name) {
                        queue.ready.push_front(message);
                    }
                    receiver_gone = true;
                    break;
                }
                channel
                    .unacked
                    .insert(self.next_delivery_tag, (queue_name.clone(), message));
            }

            if receiver_gone {
                self.registrations.remove(index);
            } else {
                index += 1;
            }
        }
    }

    /// Close a channel: end its consumers and return unacked messages to their queues.
    fn close_channel(&mut self, channel_id: u64, error: Option<&str>) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let unacked: Vec<_> = channel.unacked.drain().collect();

        let (ended, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.registrations)
            .into_iter()
            .partition(|reg| reg.channel_id == channel_id);
        self.registrations = kept;
        if let Some(message) = error {
            for reg in &ended {
                let _ = reg
                    .sender
                    .send(Err(BrokerError::Connection(message.to_string())));
            }
        }

        // Requeue oldest first so original order is restored at the head.
        let mut unacked = unacked;
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, (queue, mut message)) in unacked {
            message.redelivered = true;
            self.queues
                .entry(queue)
                .or_default()
                .ready
                .push_front(message);
        }

        self.dispatch();
    }

    fn channel_open(&self, channel_id: u64) -> Result<&ChannelState> {
        match self.channels.get(&channel_id) {
            Some(channel) if channel.open.load(Ordering::SeqCst) => Ok(channel),
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> Result<(String, Message)> {
        self.channel_open(channel_id)?;
        self.channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                BrokerError::Acknowledge(format!("unknown delivery tag {}", delivery_tag))
            })
    }
}

/// In-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<State>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts.
    pub async fn fail_next_connects(&self, count: usize) {
        self.state.lock().await.fail_next_connects = count;
    }

    pub async fn set_fail_all_connects(&self, fail: bool) {
        self.state.lock().await.fail_all_connects = fail;
    }

    /// Number of `connect()` calls so far, failed ones included.
    pub async fn connect_attempts(&self) -> usize {
        self.state.lock().await.connect_times.len()
    }

    /// When each `connect()` call happened.
    pub async fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().await.connect_times.clone()
    }

    /// Enqueue a message, creating the queue if it does not exist yet.
    pub async fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                body: body.into(),
                message_id: None,
                redelivered: false,
            });
        state.dispatch();
    }

    /// Messages waiting in `queue`, not counting unacked deliveries.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub async fn queue_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn declared_queue(&self, queue: &str) -> Option<QueueSpec> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .and_then(|q| q.spec.clone())
    }

    /// Every ack and reject, in order.
    pub async fn outcomes(&self) -> Vec<Outcome> {
        self.state.lock().await.outcomes.clone()
    }

    /// Poll until at least `count` deliveries have been settled.
    pub async fn wait_for_outcomes(&self, count: usize) -> Vec<Outcome> {
        loop {
            {
                let state = self.state.lock().await;
                if state.outcomes.len() >= count {
                    return state.outcomes.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Prefetch of every open channel.
    pub async fn prefetch_counts(&self) -> Vec<u16> {
        self.state
            .lock()
            .await
            .channels
            .values()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .map(|c| c.prefetch)
            .collect()
    }

    pub async fn open_channels(&self) -> usize {
        self.state
            .lock()
            .await
            .channels
            .values()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    /// Deliveries handed out and not yet settled, across all channels.
    pub async fn in_flight(&self) -> usize {
        self.state
            .lock()
            .await
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub async fn active_consumers(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .registrations
            .iter()
            .filter(|r| r.queue == queue)
            .count()
    }

    pub async fn cancelled_consumers(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    /// Sever every open connection, as a broker restart would.
    pub async fn drop_connections(&self) {
        let mut state = self.state.lock().await;
        let open: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.open.load(Ordering::SeqCst))
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.close_channel(id, Some("connection reset by broker"));
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.state.lock().await;
        state.connect_times.push(Instant::now());

        if state.fail_all_connects {
            return Err(BrokerError::Connection("Mock connection refused".to_string()));
        }
        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(BrokerError::Connection("Mock connection refused".to_string()));
        }

        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let open = Arc::new(AtomicBool::new(true));
        state.channels.insert(
            id,
            ChannelState {
                open: open.clone(),
                prefetch: 0,
                unacked: HashMap::new(),
            },
        );

        Ok(Box::new(MockChannel {
            id,
            open,
            state: self.state.clone(),
        }))
    }
}

/// Channel handed out by [`MockBroker`].
pub struct MockChannel {
    id: u64,
    open: Arc<AtomicBool>,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channel_open(self.id)?;

        let queue = state.queues.entry(spec.name.clone()).or_default();
        match &queue.spec {
            Some(existing) if existing != spec => Err(BrokerError::Declare {
                queue: spec.name.clone(),
                message: "inequivalent arguments for existing queue".to_string(),
            }),
            _ => {
                queue.spec = Some(spec.clone());
                Ok(())
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channel_open(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        state.dispatch();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.state.lock().await;
        state.channel_open(self.id)?;
        if !state.queues.get(queue).is_some_and(|q| q.spec.is_some()) {
            return Err(BrokerError::Consume(format!("no queue '{}'", queue)));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        state.registrations.push(Registration {
            channel_id: self.id,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            sender,
        });
        state.dispatch();

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let (queue, message) = state.settle(self.id, delivery_tag)?;
        state.outcomes.push(Outcome::Acked {
            queue,
            body: message.body,
        });
        state.dispatch();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let (queue, message) = state.settle(self.id, delivery_tag)?;
        state.outcomes.push(Outcome::Rejected {
            queue: queue.clone(),
            body: message.body.clone(),
            requeue,
        });

        if requeue {
            let mut message = message;
            message.redelivered = true;
            state
                .queues
                .entry(queue)
                .or_default()
                .ready
                .push_front(message);
        } else {
            let dead_letter = state
                .queues
                .get(&queue)
                .and_then(|q| q.spec.as_ref())
                .and_then(|spec| spec.dead_letter_routing_key.clone());
            if let Some(target) = dead_letter {
                state
                    .queues
                    .entry(target)
                    .or_default()
                    .ready
                    .push_back(Message {
                        redelivered: false,
                        ..message
                    });
            }
        }

        state.dispatch();
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channel_open(self.id)?;
        let id = self.id;
        state
            .registrations
            .retain(|r| !(r.channel_id == id && r.tag == consumer_tag));
        state.cancelled.push(consumer_tag.to_string());
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], message_id: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.channel_open(self.id)?;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(Message {
                body: body.to_vec(),
                message_id: message_id.map(str::to_string),
                redelivered: false,
            });
        state.dispatch();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.close_channel(self.id, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::queue_topology;

    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    async fn declared_channel(broker: &MockBroker, queue: &str) -> Box<dyn BrokerChannel> {
        let channel = broker.connect().await.unwrap();
        for spec in queue_topology(queue, ".dlq", WEEK) {
            channel.declare_queue(&spec).await.unwrap();
        }
        channel
    }

    #[tokio::test]
    async fn test_scripted_connect_failures() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2).await;

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts().await, 3);
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight_deliveries() {
        let broker = MockBroker::new();
        let channel = declared_channel(&broker, "products").await;
        channel.set_prefetch(2).await.unwrap();
        for i in 0..5 {
            broker.publish("products", format!("m{i}")).await;
        }

        let mut stream = channel.consume("products", "tag").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let _second = stream.next().await.unwrap().unwrap();

        assert_eq!(broker.in_flight().await, 2);
        assert_eq!(broker.queue_depth("products").await, 3);

        channel.ack(first.delivery_tag).await.unwrap();
        assert_eq!(broker.in_flight().await, 2);
        assert_eq!(broker.queue_depth("products").await, 2);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = MockBroker::new();
        let channel = declared_channel(&broker, "prices").await;
        broker.publish("prices", "bad").await;

        let mut stream = channel.consume("prices", "tag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_messages("prices.dlq").await, vec![b"bad".to_vec()]);
        assert_eq!(broker.queue_depth("prices").await, 0);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = MockBroker::new();
        let channel = declared_channel(&broker, "stocks").await;
        broker.publish("stocks", "retry me").await;

        let mut stream = channel.consume("stocks", "tag").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        channel.reject(first.delivery_tag, true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, b"retry me");
    }

    #[tokio::test]
    async fn test_drop_connections_requeues_unacked_and_errors_stream() {
        let broker = MockBroker::new();
        let channel = declared_channel(&broker, "products").await;
        broker.publish("products", "m1").await;

        let mut stream = channel.consume("products", "tag").await.unwrap();
        let _delivery = stream.next().await.unwrap().unwrap();

        broker.drop_connections().await;

        assert!(!channel.is_open());
        assert!(matches!(
            stream.next().await,
            Some(Err(BrokerError::Connection(_)))
        ));
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("products").await, 1);
        assert!(matches!(
            channel.ack(1).await,
            Err(BrokerError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_arguments_fails() {
        let broker = MockBroker::new();
        let channel = declared_channel(&broker, "products").await;

        let result = channel
            .declare_queue(&QueueSpec::dead_letter("products", WEEK))
            .await;
        assert!(matches!(result, Err(BrokerError::Declare { .. })));
    }
}
