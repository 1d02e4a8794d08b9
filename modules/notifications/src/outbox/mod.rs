//! Transactional outbox
//!
//! Business code records a notification-worthy fact with [`Outbox::append`]
//! (or [`crate::repos::append_in_tx`] inside its own Postgres transaction).
//! The [`publisher::OutboxPublisher`] then forwards rows to the broker, both
//! right after commit via a [`CommitHook`] and from a periodic sweep.

pub mod publisher;
pub mod retention;

pub use publisher::{OutboxPublisher, PublishAttempt, PublishReport, PublisherConfig};
pub use retention::RetentionJob;

use chrono::{DateTime, Utc};
use event_bus::NotificationEventPayload;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::metrics::Metrics;
use crate::models::{routing_key, Audience, NewOutboxEvent, OutboxEvent, OutboxPayload};
use crate::store::{OutboxStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// No audience can be derived; the event is never published with a
    /// guessed routing key
    #[error("event {event_id} is unroutable: {reason}")]
    UnroutableEvent { event_id: String, reason: String },

    #[error("invalid outbox event: {0}")]
    InvalidEvent(String),

    #[error("outbox store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where an outbox row goes on the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub audience: Audience,
    pub subject: String,
}

/// Derive the audience and routing key for an outbox row
///
/// The payload's `recipient_type` wins when present; otherwise the
/// aggregate type is used. Either way the value must be in the fixed
/// audience mapping.
pub fn resolve_route(
    aggregate_type: &str,
    event_type: &str,
    payload: &OutboxPayload,
) -> Result<Route, String> {
    let discriminator = payload
        .recipient_type
        .as_deref()
        .filter(|rt| !rt.trim().is_empty())
        .unwrap_or(aggregate_type);

    let audience = Audience::from_recipient_type(discriminator)
        .ok_or_else(|| format!("no audience mapping for '{}'", discriminator))?;

    if event_type.trim().is_empty() {
        return Err("event_type is empty".to_string());
    }

    Ok(Route {
        audience,
        subject: routing_key(audience, event_type),
    })
}

/// Typed view of a row's payload snapshot
pub fn outbox_payload(event: &OutboxEvent) -> Result<OutboxPayload, OutboxError> {
    serde_json::from_value(event.payload.clone()).map_err(|e| OutboxError::UnroutableEvent {
        event_id: event.event_id.clone(),
        reason: format!("payload is not a notification snapshot: {}", e),
    })
}

/// Broker body for an outbox row
pub fn broker_payload(event: &OutboxEvent, payload: OutboxPayload) -> NotificationEventPayload {
    let recipient_type = payload
        .recipient_type
        .filter(|rt| !rt.trim().is_empty())
        .unwrap_or_else(|| event.aggregate_type.clone());

    NotificationEventPayload::new(
        event.event_id.clone(),
        event.event_type.clone(),
        recipient_type,
    )
    .with_recipient_id(payload.recipient_id.or(event.aggregate_id))
    .with_restaurant_id(payload.restaurant_id)
    .with_customer_id(payload.customer_id)
    .with_agency_id(payload.agency_id)
    .with_admin_id(payload.admin_id)
    .with_timestamp(event.created_at)
    .with_data(payload.data)
}

/// Build and validate a row for insertion
///
/// Fails fast on events that could never be routed, so the caller's
/// transaction aborts instead of committing a fact nobody can deliver.
pub fn prepare(
    aggregate_type: &str,
    aggregate_id: Option<i64>,
    event_type: &str,
    payload: Value,
) -> Result<NewOutboxEvent, OutboxError> {
    if aggregate_type.trim().is_empty() {
        return Err(OutboxError::InvalidEvent("aggregate_type is empty".to_string()));
    }
    if event_type.trim().is_empty() {
        return Err(OutboxError::InvalidEvent("event_type is empty".to_string()));
    }

    let new = NewOutboxEvent::new(aggregate_type, aggregate_id, event_type, payload);

    let typed: OutboxPayload = serde_json::from_value(new.payload.clone())
        .map_err(|e| OutboxError::InvalidEvent(format!("payload: {}", e)))?;
    resolve_route(aggregate_type, event_type, &typed).map_err(|reason| {
        OutboxError::UnroutableEvent {
            event_id: new.event_id.clone(),
            reason,
        }
    })?;

    Ok(new)
}

/// Post-commit signal into the publisher loop
///
/// A lost signal only delays publication until the next sweep.
#[derive(Debug, Clone)]
pub struct CommitHook {
    sender: mpsc::UnboundedSender<i64>,
}

impl CommitHook {
    pub fn committed(&self, outbox_id: i64) {
        if self.sender.send(outbox_id).is_err() {
            tracing::debug!(outbox_id, "Publisher loop gone, row left for the sweep");
        }
    }
}

pub fn commit_hook() -> (CommitHook, mpsc::UnboundedReceiver<i64>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (CommitHook { sender }, receiver)
}

/// The write entry point business code uses
#[derive(Clone)]
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    hook: Option<CommitHook>,
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store, hook: None }
    }

    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: Option<i64>,
        event_type: &str,
        payload: Value,
    ) -> Result<OutboxEvent, OutboxError> {
        let new = prepare(aggregate_type, aggregate_id, event_type, payload)?;
        let event = self.store.append(new).await?;

        tracing::debug!(
            outbox_id = event.id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Event appended to outbox"
        );

        if let Some(hook) = &self.hook {
            hook.committed(event.id);
        }

        Ok(event)
    }
}

pub async fn refresh_outbox_gauges(
    store: &dyn OutboxStore,
    metrics: &Metrics,
    max_attempts: i32,
) -> Result<(), StoreError> {
    let counts = store.counts(max_attempts).await?;
    metrics.set_outbox_counts(&counts);
    Ok(())
}

/// Scheduled time of the next attempt after `retry_count` failures
pub(crate) fn next_attempt_at(
    now: DateTime<Utc>,
    backoff: &event_bus::consumer_retry::RetryConfig,
    retry_count: i32,
) -> DateTime<Utc> {
    let attempt = u32::try_from(retry_count.max(1)).unwrap_or(1);
    let delay = backoff.backoff_for_attempt(attempt);
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
