//! Queue consumer.
//!
//! One `Consumer` drives one queue from one tokio task:
//!
//! ```text
//! Disconnected -> Connecting -> Consuming -> (ReconnectPending -> Connecting)* -> Stopped
//! ```
//!
//! Deliveries are handled strictly one at a time. Each is decoded, passed to
//! the [`ProcessingHook`], then acked, dead-lettered or requeued according to
//! the [`Disposition`] of the outcome.
//!
//! Connection setup retries with exponential backoff. Failing the initial
//! connection `max_connect_attempts` times ends `start()` with
//! [`ConsumerError::ConnectExhausted`]. Once consuming, a lost connection is
//! retried until the consumer is stopped.

pub mod disposition;
pub mod hook;


pub use disposition::Disposition;
pub use hook::{CollectionHook, ProcessError, ProcessingHook, Target};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::{FutureExt, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::broker::{
    self, dead_letter_queue_name, queue_topology, Broker, BrokerChannel, BrokerError, Delivery,
    DeliveryStream,
};
use crate::config::BrokerConfig;
use crate::utils::retry::connection_backoff;

/// Tuning for one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub prefetch_count: u16,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Total connection attempts per connect cycle, the first one included.
    pub max_connect_attempts: usize,
    pub reconnect_delay: Duration,
    pub dlq_suffix: String,
    pub dlq_message_ttl: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
            max_connect_attempts: 10,
            reconnect_delay: Duration::from_secs(5),
            dlq_suffix: ".dlq".to_string(),
            dlq_message_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl From<&BrokerConfig> for ConsumerSettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            prefetch_count: config.prefetch_count,
            retry_delay: config.retry_delay(),
            max_retry_delay: config.max_retry_delay(),
            max_connect_attempts: config.max_connect_attempts,
            reconnect_delay: config.reconnect_delay(),
            dlq_suffix: config.dlq_suffix.clone(),
            dlq_message_ttl: config.dlq_message_ttl(),
        }
    }
}

/// Errors that end a consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Failed to connect consumer for queue '{queue}' after {attempts} attempts: {source}")]
    ConnectExhausted {
        queue: String,
        attempts: usize,
        #[source]
        source: BrokerError,
    },
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Consuming,
    ReconnectPending,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Consuming => "consuming",
            ConsumerState::ReconnectPending => "reconnect_pending",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Control handle for a running consumer. Clones share the same consumer.
#[derive(Clone)]
pub struct ConsumerHandle {
    queue: String,
    stop: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
    done: watch::Receiver<bool>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask the consumer to stop. Returns immediately.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver for state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Wait until `start()` has returned.
    ///
    /// Returns `false` if `timeout` elapsed first, or if the consumer task
    /// went away without finishing (aborted or panicked).
    pub async fn wait_for_shutdown(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.clone();
        let finished = async move { done.wait_for(|finished| *finished).await.is_ok() };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .unwrap_or(false),
            None => finished.await,
        }
    }
}

/// Result of one connect cycle.
enum Connect {
    Ready,
    Stopped,
    Exhausted { attempts: usize, error: BrokerError },
}

/// Result of waiting for the next delivery.
enum Next {
    Delivery(Delivery),
    Stopped,
    Lost(String),
}

/// Consumes one queue.
pub struct Consumer {
    queue: String,
    dead_letter_queue: String,
    consumer_tag: String,
    broker: Arc<dyn Broker>,
    hook: Arc<dyn ProcessingHook>,
    settings: ConsumerSettings,
    channel: Option<Box<dyn BrokerChannel>>,
    consuming: bool,
    stop_tx: Arc<watch::Sender<bool>>,
    stop: watch::Receiver<bool>,
    state: watch::Sender<ConsumerState>,
    done: watch::Sender<bool>,
}

impl Consumer {
    pub fn new(
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        hook: Arc<dyn ProcessingHook>,
        settings: ConsumerSettings,
    ) -> Self {
        let queue = queue.into();
        let (stop_tx, stop) = watch::channel(false);
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        let (done, _) = watch::channel(false);

        Self {
            dead_letter_queue: dead_letter_queue_name(&queue, &settings.dlq_suffix),
            consumer_tag: format!("catalog-ingest.{}.{}", queue, Uuid::new_v4().simple()),
            queue,
            broker,
            hook,
            settings,
            channel: None,
            consuming: false,
            stop_tx: Arc::new(stop_tx),
            stop,
            state,
            done,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            queue: self.queue.clone(),
            stop: self.stop_tx.clone(),
            state: self.state.subscribe(),
            done: self.done.subscribe(),
        }
    }

    /// Connect and consume until stopped.
    ///
    /// Returns `Ok(())` after a requested stop. The completion latch observed
    /// by [`ConsumerHandle::wait_for_shutdown`] fires whenever this returns.
    pub async fn start(mut self) -> Result<(), ConsumerError> {
        info!(queue = %self.queue, dlq = %self.dead_letter_queue, "Starting consumer");

        let mut deliveries = None;
        let result = self.run(&mut deliveries).await;
        self.shutdown(deliveries.is_some()).await;
        result
    }

    async fn run(&mut self, deliveries: &mut Option<DeliveryStream>) -> Result<(), ConsumerError> {
        self.set_state(ConsumerState::Connecting);
        match self.connect().await {
            Connect::Ready => {}
            Connect::Stopped => return Ok(()),
            Connect::Exhausted { attempts, error } => {
                error!(
                    queue = %self.queue,
                    attempts,
                    error = %error,
                    "Failed to connect to broker after maximum attempts"
                );
                return Err(ConsumerError::ConnectExhausted {
                    queue: self.queue.clone(),
                    attempts,
                    source: error,
                });
            }
        }
        self.consuming = true;

        while !self.stop_requested() {
            if deliveries.is_none() {
                if !self.consuming {
                    break;
                }
                match self.register().await {
                    Ok(stream) => *deliveries = Some(stream),
                    Err(e) => {
                        warn!(queue = %self.queue, error = %e, "Failed to register consumer");
                        if !self.reconnect().await {
                            break;
                        }
                    }
                }
                continue;
            }
            let Some(stream) = deliveries.as_mut() else {
                continue;
            };

            match self.next_delivery(stream).await {
                Next::Delivery(delivery) => self.handle_delivery(delivery).await,
                Next::Stopped => break,
                Next::Lost(reason) => {
                    warn!(queue = %self.queue, reason = %reason, "Lost broker connection");
                    *deliveries = None;
                    if !self.reconnect().await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Open a channel and declare the queue topology, retrying with backoff.
    async fn connect(&mut self) -> Connect {
        let max_attempts = self.settings.max_connect_attempts;
        let mut delays = connection_backoff(
            self.settings.retry_delay,
            self.settings.max_retry_delay,
            max_attempts,
        )
        .build();
        let mut attempt = 0;

        loop {
            if self.stop_requested() {
                return Connect::Stopped;
            }
            attempt += 1;

            match self.open_channel().await {
                Ok(channel) => {
                    info!(queue = %self.queue, attempt, "Connected to broker");
                    self.channel = Some(channel);
                    return Connect::Ready;
                }
                Err(e) => match delays.next() {
                    Some(delay) => {
                        warn!(
                            queue = %self.queue,
                            attempt,
                            max_attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Broker connection failed, retrying"
                        );
                        if !self.pause(delay).await {
                            return Connect::Stopped;
                        }
                    }
                    None => {
                        return Connect::Exhausted {
                            attempts: attempt,
                            error: e,
                        }
                    }
                },
            }
        }
    }

    async fn open_channel(&self) -> broker::Result<Box<dyn BrokerChannel>> {
        let channel = self.broker.connect().await?;
        if let Err(e) = self.declare_topology(channel.as_ref()).await {
            if let Err(close_error) = channel.close().await {
                debug!(queue = %self.queue, error = %close_error, "Failed to close channel");
            }
            return Err(e);
        }
        Ok(channel)
    }

    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> broker::Result<()> {
        channel.set_prefetch(self.settings.prefetch_count).await?;
        for spec in queue_topology(
            &self.queue,
            &self.settings.dlq_suffix,
            self.settings.dlq_message_ttl,
        ) {
            channel.declare_queue(&spec).await?;
        }
        Ok(())
    }

    async fn register(&mut self) -> broker::Result<DeliveryStream> {
        let channel = self.channel.as_ref().ok_or(BrokerError::ChannelClosed)?;
        let stream = channel.consume(&self.queue, &self.consumer_tag).await?;

        self.consuming = true;
        self.set_state(ConsumerState::Consuming);
        info!(
            queue = %self.queue,
            consumer_tag = %self.consumer_tag,
            prefetch = self.settings.prefetch_count,
            "Consuming"
        );
        Ok(stream)
    }

    /// Drop the dead channel and connect again.
    ///
    /// Never gives up on its own; returns `false` only when stopped.
    async fn reconnect(&mut self) -> bool {
        self.set_state(ConsumerState::ReconnectPending);
        self.release_channel().await;

        loop {
            if !self.pause(self.settings.reconnect_delay).await {
                return false;
            }
            self.set_state(ConsumerState::Connecting);

            match self.connect().await {
                Connect::Ready => return true,
                Connect::Stopped => return false,
                Connect::Exhausted { attempts, error } => {
                    error!(
                        queue = %self.queue,
                        attempts,
                        error = %error,
                        "Reconnect attempts exhausted, will try again"
                    );
                    self.set_state(ConsumerState::ReconnectPending);
                }
            }
        }
    }

    async fn next_delivery(&self, stream: &mut DeliveryStream) -> Next {
        if !self.channel.as_ref().is_some_and(|c| c.is_open()) {
            return Next::Lost("channel closed".to_string());
        }

        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => Next::Stopped,
            item = stream.next() => match item {
                Some(Ok(delivery)) => Next::Delivery(delivery),
                Some(Err(e)) => Next::Lost(e.to_string()),
                None => Next::Lost("delivery stream ended".to_string()),
            },
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let span = info_span!(
            "consume",
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            message_id = delivery.message_id.as_deref().unwrap_or("-"),
        );

        async {
            let disposition = self.process(&delivery).await;
            self.settle(delivery.delivery_tag, disposition).await;
        }
        .instrument(span)
        .await
    }

    async fn process(&self, delivery: &Delivery) -> Disposition {
        let payload = match std::str::from_utf8(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to decode message body, dead-lettering");
                return Disposition::DEAD_LETTER;
            }
        };

        if delivery.redelivered {
            info!("Processing redelivered message");
        }

        let outcome = match AssertUnwindSafe(self.hook.process(payload))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    "Processing hook panicked, requeueing"
                );
                return Disposition::REQUEUE;
            }
        };

        match &outcome {
            Ok(()) => debug!("Message processed"),
            Err(e) if e.is_validation() => {
                warn!(error = %e, "Message failed validation, dead-lettering")
            }
            Err(e) => error!(
                error = %e,
                redelivered = delivery.redelivered,
                "Message processing failed, requeueing"
            ),
        }
        Disposition::from_outcome(&outcome)
    }

    async fn settle(&self, delivery_tag: u64, disposition: Disposition) {
        let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) else {
            debug!(delivery_tag, ?disposition, "Channel closed, delivery left to the broker");
            return;
        };

        let result = match disposition {
            Disposition::Ack => channel.ack(delivery_tag).await,
            Disposition::Reject { requeue } => channel.reject(delivery_tag, requeue).await,
        };
        if let Err(e) = result {
            error!(delivery_tag, ?disposition, error = %e, "Failed to settle delivery");
        }
    }

    /// Sleep for `delay` unless stopped first. Returns `false` when stopped.
    async fn pause(&self, delay: Duration) -> bool {
        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn release_channel(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(queue = %self.queue, error = %e, "Failed to close channel");
            }
        }
    }

    async fn shutdown(&mut self, registered: bool) {
        if registered {
            if let Some(channel) = self.channel.as_ref().filter(|c| c.is_open()) {
                if let Err(e) = channel.cancel(&self.consumer_tag).await {
                    warn!(queue = %self.queue, error = %e, "Failed to cancel consumer");
                }
            }
        }
        self.consuming = false;
        self.release_channel().await;
        self.set_state(ConsumerState::Stopped);
        self.done.send_replace(true);
        info!(queue = %self.queue, "Consumer stopped");
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(queue = %self.queue, from = %previous, to = %state, "Consumer state changed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
