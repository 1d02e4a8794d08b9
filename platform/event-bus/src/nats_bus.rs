//! NATS JetStream implementation of the EventBus trait
//!
//! Topic subjects are persisted in one stream; each [`QueueSpec`] becomes a
//! durable pull consumer filtered on the queue pattern, with explicit acks and
//! a delivery limit. Messages that exhaust the limit, or are nacked without
//! requeue, are republished to `<queue>.dlq` (captured by a per-queue stream)
//! and terminated.

use crate::subject::validate_pattern;
use crate::{Acker, BusError, BusMessage, BusResult, Delivery, EventBus, QueueSpec};
use async_nats::jetstream::{self, consumer, stream, AckKind};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;

const DEFAULT_STREAM: &str = "NOTIFICATIONS";
const DEFAULT_SUBJECTS: &str = "notification.>";
const DEFAULT_MAX_DELIVER: i64 = 5;
const ACK_WAIT: Duration = Duration::from_secs(30);

/// EventBus implementation using NATS JetStream
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::new(nats_client).with_max_deliver(5);
///
/// bus.publish("notification.customer.reservation_new", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    stream_name: String,
    subjects: Vec<String>,
    max_deliver: i64,
    stream: std::sync::Arc<OnceCell<stream::Stream>>,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            stream_name: DEFAULT_STREAM.to_string(),
            subjects: vec![DEFAULT_SUBJECTS.to_string()],
            max_deliver: DEFAULT_MAX_DELIVER,
            stream: std::sync::Arc::new(OnceCell::new()),
        }
    }

    /// Override the stream that persists topic subjects
    pub fn with_stream(mut self, name: impl Into<String>, subjects: Vec<String>) -> Self {
        self.stream_name = name.into();
        self.subjects = subjects;
        self
    }

    /// Deliveries per message before it is dead-lettered
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = i64::from(max_deliver.max(1));
        self
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn topic_stream(&self) -> BusResult<&stream::Stream> {
        self.stream
            .get_or_try_init(|| async {
                self.jetstream
                    .get_or_create_stream(stream::Config {
                        name: self.stream_name.clone(),
                        subjects: self.subjects.clone(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BusError::ConnectionError(e.to_string()))
            })
            .await
    }

    async fn consumer(&self, queue: &QueueSpec) -> BusResult<consumer::PullConsumer> {
        validate_pattern(&queue.pattern).map_err(BusError::InvalidSubject)?;

        self.jetstream
            .get_or_create_stream(stream::Config {
                name: format!("{}_DLQ", jetstream_name(&queue.name)),
                subjects: vec![queue.dead_letter_subject()],
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let durable = jetstream_name(&queue.name);
        self.topic_stream()
            .await?
            .get_or_create_consumer(
                &durable,
                consumer::pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: queue.pattern.clone(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver: self.max_deliver,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))
    }
}

/// JetStream names may not contain `.`
fn jetstream_name(name: &str) -> String {
    name.replace(['.', '*', '>', ' '], "_").to_uppercase()
}

fn to_bus_message(message: &async_nats::Message) -> BusMessage {
    let mut msg = BusMessage::new(message.subject.to_string(), message.payload.to_vec());

    if let Some(nats_headers) = &message.headers {
        let mut headers = HashMap::new();
        for (key, values) in nats_headers.iter() {
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    msg
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.topic_stream().await?;

        self.jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> BusResult<()> {
        self.consumer(queue).await.map(|_| ())
    }

    async fn consume(&self, queue: &QueueSpec) -> BusResult<BoxStream<'static, Delivery>> {
        let consumer = self.consumer(queue).await?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let jetstream = self.jetstream.clone();
        let dead_letter_subject = queue.dead_letter_subject();
        let max_deliver = self.max_deliver;
        let queue_name = queue.name.clone();

        let stream = async_stream::stream! {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(queue = %queue_name, error = %e, "JetStream pull failed");
                        continue;
                    }
                };

                let attempt = message
                    .info()
                    .map(|info| info.delivered)
                    .unwrap_or(1)
                    .clamp(1, i64::from(u32::MAX)) as u32;
                let bus_message = to_bus_message(&message.message);

                let acker = JetStreamAcker {
                    message,
                    jetstream: jetstream.clone(),
                    dead_letter_subject: dead_letter_subject.clone(),
                    last_attempt: i64::from(attempt) >= max_deliver,
                };

                yield Delivery::new(bus_message, attempt, Box::new(acker));
            }
        };

        Ok(stream.boxed())
    }
}

struct JetStreamAcker {
    message: jetstream::Message,
    jetstream: jetstream::Context,
    dead_letter_subject: String,
    last_attempt: bool,
}

impl JetStreamAcker {
    async fn dead_letter(self) -> BusResult<()> {
        self.jetstream
            .publish(
                self.dead_letter_subject.clone(),
                self.message.message.payload.clone(),
            )
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        tracing::warn!(
            subject = %self.message.message.subject,
            dead_letter_subject = %self.dead_letter_subject,
            "Message dead-lettered"
        );

        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> BusResult<()> {
        if !requeue || self.last_attempt {
            return self.dead_letter().await;
        }

        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    fn abandon(self: Box<Self>) {
        // Without a runtime the ack wait timeout triggers redelivery instead
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = self.nack(true).await {
                    tracing::warn!(error = %e, "Failed to return abandoned delivery");
                }
            });
        }
    }
}
