//! # EventBus Abstraction
//!
//! Broker-facing messaging for the notification pipeline.
//!
//! Producers publish to topic subjects (`notification.<audience>.<event>`);
//! consumers read from durable named queues bound to a subject pattern and
//! settle every message explicitly. Nothing is auto-acknowledged: a message
//! that is nacked, or dropped without being settled, comes back until the
//! broker's delivery limit moves it to the dead-letter path.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation using in-process queues
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, InMemoryBus, QueueSpec};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let queue = QueueSpec::new("notifications.restaurant", "notification.restaurant.>");
//! let mut deliveries = bus.consume(&queue).await?;
//!
//! bus.publish("notification.restaurant.reservation_new", b"{}".to_vec()).await?;
//!
//! if let Some(delivery) = deliveries.next().await {
//!     println!("attempt {} on {}", delivery.attempt(), delivery.message().subject);
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod subject;

pub use envelope::{validate_payload_fields, NotificationEventPayload};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;
pub use subject::matches_pattern;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// A message carried by the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<HashMap<String, String>>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// A durable queue bound to a subject pattern
///
/// Patterns use NATS-style wildcards: `*` matches one token, `>` matches one
/// or more trailing tokens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueSpec {
    pub name: String,
    pub pattern: String,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
        }
    }

    /// Subject that dead-lettered messages of this queue are routed to
    pub fn dead_letter_subject(&self) -> String {
        format!("{}.dlq", self.name)
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("failed to settle message: {0}")]
    AckError(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Broker-side settlement of one delivery
///
/// Implementations are consumed on use: a delivery is settled exactly once.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> BusResult<()>;

    /// Negative acknowledgment. `requeue = true` asks for redelivery (subject
    /// to the broker's delivery limit); `false` dead-letters immediately.
    async fn nack(self: Box<Self>, requeue: bool) -> BusResult<()>;

    /// Called when a delivery is dropped without being settled.
    fn abandon(self: Box<Self>);
}

/// A message handed to a consumer, awaiting settlement
pub struct Delivery {
    message: BusMessage,
    attempt: u32,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(message: BusMessage, attempt: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            message,
            attempt,
            acker: Some(acker),
        }
    }

    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    /// 1-based delivery attempt for this message on its queue
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub async fn ack(mut self) -> BusResult<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Err(BusError::AckError("delivery already settled".to_string())),
        }
    }

    pub async fn nack(mut self, requeue: bool) -> BusResult<()> {
        match self.acker.take() {
            Some(acker) => acker.nack(requeue).await,
            None => Err(BusError::AckError("delivery already settled".to_string())),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(acker) = self.acker.take() {
            tracing::warn!(
                subject = %self.message.subject,
                attempt = self.attempt,
                "Delivery dropped without settlement, returning it to the broker"
            );
            acker.abandon();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("attempt", &self.attempt)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// Core event bus abstraction
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject
    ///
    /// Returns `Ok(())` only after the broker has accepted the message.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &QueueSpec) -> BusResult<()>;

    /// Consume a durable queue with manual acknowledgment
    ///
    /// Declares the queue if needed. Several consumers of the same queue
    /// compete for its messages.
    async fn consume(&self, queue: &QueueSpec) -> BusResult<BoxStream<'static, Delivery>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
