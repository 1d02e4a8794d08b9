//! In-memory implementation of the EventBus trait for testing and development

use crate::subject::{matches_pattern, validate_pattern};
use crate::{Acker, BusError, BusMessage, BusResult, Delivery, EventBus, QueueSpec};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Deliveries allowed per message before it is dead-lettered
pub const DEFAULT_MAX_DELIVER: u32 = 5;

struct Pending {
    message: BusMessage,
    attempt: u32,
}

#[derive(Clone)]
struct QueueState {
    pattern: String,
    sender: mpsc::UnboundedSender<Pending>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Pending>>>,
    dead_letters: Arc<Mutex<Vec<BusMessage>>>,
}

impl QueueState {
    fn new(pattern: String) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            pattern,
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// EventBus implementation using in-process durable queues
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated message buses
///
/// Every declared queue receives a copy of each message whose subject matches
/// its pattern. Messages stay queued until a consumer takes them; consumers of
/// the same queue compete. A nacked or abandoned message is redelivered with
/// its attempt counter incremented until `max_deliver` is reached, then moved
/// to the queue's dead-letter list.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus, QueueSpec};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let queue = QueueSpec::new("test", "test.events.>");
/// let mut deliveries = bus.consume(&queue).await?;
///
/// bus.publish("test.events.created", b"hello".to_vec()).await?;
///
/// let delivery = deliveries.next().await.unwrap();
/// assert_eq!(delivery.message().payload, b"hello");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    queues: Arc<Mutex<HashMap<String, QueueState>>>,
    available: Arc<AtomicBool>,
    max_deliver: u32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_max_deliver(DEFAULT_MAX_DELIVER)
    }

    /// Create a bus that dead-letters a message after `max_deliver` deliveries
    pub fn with_max_deliver(max_deliver: u32) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            max_deliver: max_deliver.max(1),
        }
    }

    /// Simulate broker outage: while unavailable, `publish` fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Messages moved to the dead-letter list of `queue`
    pub fn dead_letters(&self, queue: &str) -> Vec<BusMessage> {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .get(queue)
            .map(|q| {
                q.dead_letters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            })
            .unwrap_or_default()
    }

    fn declare(&self, queue: &QueueSpec) -> BusResult<QueueState> {
        validate_pattern(&queue.pattern).map_err(BusError::InvalidSubject)?;

        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let state = queues
            .entry(queue.name.clone())
            .or_insert_with(|| QueueState::new(queue.pattern.clone()));

        if state.pattern != queue.pattern {
            return Err(BusError::InvalidSubject(format!(
                "queue '{}' already bound to '{}'",
                queue.name, state.pattern
            )));
        }

        Ok(state.clone())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(
                "in-memory broker unavailable".to_string(),
            ));
        }

        let targets: Vec<mpsc::UnboundedSender<Pending>> = {
            let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            queues
                .values()
                .filter(|q| matches_pattern(subject, &q.pattern))
                .map(|q| q.sender.clone())
                .collect()
        };

        if targets.is_empty() {
            tracing::debug!(subject = %subject, "No queue bound for subject, message dropped");
        }

        for sender in targets {
            sender
                .send(Pending {
                    message: BusMessage::new(subject.to_string(), payload.clone()),
                    attempt: 1,
                })
                .map_err(|_| BusError::PublishError(format!("queue closed for {}", subject)))?;
        }

        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> BusResult<()> {
        self.declare(queue).map(|_| ())
    }

    async fn consume(&self, queue: &QueueSpec) -> BusResult<BoxStream<'static, Delivery>> {
        let state = self.declare(queue)?;
        let max_deliver = self.max_deliver;
        let queue_name = queue.name.clone();

        let stream = async_stream::stream! {
            loop {
                let next = {
                    let mut receiver = state.receiver.lock().await;
                    receiver.recv().await
                };

                match next {
                    Some(pending) => {
                        let acker = InMemoryAcker {
                            queue: queue_name.clone(),
                            sender: state.sender.clone(),
                            dead_letters: state.dead_letters.clone(),
                            message: pending.message.clone(),
                            attempt: pending.attempt,
                            max_deliver,
                        };
                        yield Delivery::new(pending.message, pending.attempt, Box::new(acker));
                    }
                    None => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

struct InMemoryAcker {
    queue: String,
    sender: mpsc::UnboundedSender<Pending>,
    dead_letters: Arc<Mutex<Vec<BusMessage>>>,
    message: BusMessage,
    attempt: u32,
    max_deliver: u32,
}

impl InMemoryAcker {
    fn dead_letter(self) {
        tracing::warn!(
            queue = %self.queue,
            subject = %self.message.subject,
            attempt = self.attempt,
            "Message moved to dead-letter list"
        );
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.message);
    }

    fn redeliver(self) {
        if self.attempt >= self.max_deliver {
            return self.dead_letter();
        }

        let pending = Pending {
            message: self.message.clone(),
            attempt: self.attempt + 1,
        };
        if self.sender.send(pending).is_err() {
            self.dead_letter();
        }
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> BusResult<()> {
        if requeue {
            self.redeliver();
        } else {
            self.dead_letter();
        }
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        self.redeliver();
    }
}
