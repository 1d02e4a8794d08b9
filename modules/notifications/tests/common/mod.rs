//! Common test utilities for notification pipeline tests
//!
//! Everything runs against the in-memory stores and `InMemoryBus`, so these
//! tests need no Postgres or NATS.
//!
//! ## Usage
//! ```rust
//! let h = common::Harness::new();
//! common::add_staff(&h, 5, 11, &[Channel::Email]);
//! let mut deliveries = h.consume(Audience::Restaurant).await;
//! ```

#![allow(dead_code)]

use chrono::Utc;
use event_bus::consumer_retry::RetryConfig;
use event_bus::{Delivery, EventBus, InMemoryBus, NotificationEventPayload};
use futures::stream::BoxStream;
use futures::StreamExt;
use notifications_rs::listener::{AudienceListener, InMemoryConnections, ListenerCapabilities};
use notifications_rs::metrics::Metrics;
use notifications_rs::models::{channel_set, Audience, Channel};
use notifications_rs::orchestrator::{BlockedEventTypes, OrchestratorRegistry};
use notifications_rs::outbox::{Outbox, OutboxPublisher, PublisherConfig};
use notifications_rs::store::memory::{
    InMemoryDirectory, InMemoryNotificationStore, InMemoryOutboxStore, InMemoryProcessedEvents,
};
use notifications_rs::store::Recipient;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub type Deliveries = BoxStream<'static, Delivery>;

pub struct Harness {
    pub bus: Arc<InMemoryBus>,
    pub outbox_store: Arc<InMemoryOutboxStore>,
    pub ledger: Arc<InMemoryProcessedEvents>,
    pub notifications: Arc<InMemoryNotificationStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub connections: Arc<InMemoryConnections>,
    pub metrics: Metrics,
    pub blocked: Arc<BlockedEventTypes>,
    pub registry: OrchestratorRegistry,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(InMemoryBus::new(), &[])
    }

    pub fn with_max_deliver(max_deliver: u32) -> Self {
        Self::build(InMemoryBus::with_max_deliver(max_deliver), &[])
    }

    pub fn with_blocked(event_types: &[&str]) -> Self {
        Self::build(InMemoryBus::new(), event_types)
    }

    fn build(bus: InMemoryBus, blocked: &[&str]) -> Self {
        Self {
            bus: Arc::new(bus),
            outbox_store: Arc::new(InMemoryOutboxStore::new()),
            ledger: Arc::new(InMemoryProcessedEvents::new()),
            notifications: Arc::new(InMemoryNotificationStore::new()),
            directory: Arc::new(InMemoryDirectory::new()),
            connections: Arc::new(InMemoryConnections::new()),
            metrics: Metrics::new().expect("metrics registry"),
            blocked: Arc::new(BlockedEventTypes::new(
                blocked.iter().map(|s| s.to_string()),
            )),
            registry: OrchestratorRegistry::standard(),
        }
    }

    pub fn outbox(&self) -> Outbox {
        Outbox::new(self.outbox_store.clone())
    }

    pub fn publisher(&self) -> OutboxPublisher {
        self.publisher_with(PublisherConfig::default())
    }

    pub fn publisher_with(&self, config: PublisherConfig) -> OutboxPublisher {
        OutboxPublisher::new(
            self.outbox_store.clone(),
            self.bus.clone(),
            self.metrics.clone(),
            config,
        )
    }

    /// Listener with a fast in-process retry so failure tests stay quick
    pub fn listener(&self, audience: Audience) -> AudienceListener {
        Self::listener_from(self.capabilities(audience))
    }

    /// The capabilities `listener` wires, for tests that swap one out
    pub fn capabilities(&self, audience: Audience) -> ListenerCapabilities {
        let orchestrator = self
            .registry
            .get(audience)
            .expect("standard registry covers every audience");

        ListenerCapabilities {
            orchestrator,
            directory: self.directory.clone(),
            ledger: self.ledger.clone(),
            notifications: self.notifications.clone(),
            connections: self.connections.clone(),
            metrics: self.metrics.clone(),
            blocked: self.blocked.clone(),
        }
    }

    pub fn listener_from(caps: ListenerCapabilities) -> AudienceListener {
        AudienceListener::new(caps).with_retry(RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
    }

    pub async fn consume(&self, audience: Audience) -> Deliveries {
        self.bus
            .consume(&audience.queue())
            .await
            .expect("consume audience queue")
    }

    /// Publish a broker body straight to the audience's routing key
    pub async fn publish_raw(&self, subject: &str, body: &[u8]) {
        self.bus
            .publish(subject, body.to_vec())
            .await
            .expect("publish to in-memory bus");
    }

    pub async fn publish_payload(&self, subject: &str, payload: &NotificationEventPayload) {
        let body = serde_json::to_vec(payload).expect("serialize payload");
        self.publish_raw(subject, &body).await;
    }
}

// ============================================================================
// Directory seeding
// ============================================================================

pub fn add_staff(h: &Harness, restaurant_id: i64, staff_id: i64, channels: &[Channel]) {
    h.directory.add(
        Audience::Restaurant,
        Some(restaurant_id),
        Recipient::new(staff_id, channel_set(channels)),
    );
}

pub fn add_admin(h: &Harness, admin_id: i64, channels: &[Channel]) {
    h.directory
        .add(Audience::Admin, None, Recipient::new(admin_id, channel_set(channels)));
}

pub fn add_customer(h: &Harness, customer_id: i64, channels: &[Channel]) {
    h.directory.add(
        Audience::Customer,
        None,
        Recipient::new(customer_id, channel_set(channels)),
    );
}

// ============================================================================
// Payloads & deliveries
// ============================================================================

pub fn payload(
    event_id: &str,
    event_type: &str,
    recipient_type: &str,
    data: Value,
) -> NotificationEventPayload {
    NotificationEventPayload::new(event_id.into(), event_type.into(), recipient_type.into())
        .with_timestamp(Utc::now())
        .with_data(data.as_object().cloned().unwrap_or_default())
}

pub async fn next_delivery(deliveries: &mut Deliveries) -> Delivery {
    tokio::time::timeout(Duration::from_secs(2), deliveries.next())
        .await
        .expect("timed out waiting for a delivery")
        .expect("delivery stream ended")
}

pub async fn assert_no_delivery(deliveries: &mut Deliveries) {
    let next = tokio::time::timeout(Duration::from_millis(100), deliveries.next()).await;
    assert!(next.is_err(), "expected no further delivery");
}
