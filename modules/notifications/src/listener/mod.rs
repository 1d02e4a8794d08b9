//! Audience listener
//!
//! One generic listener per audience queue. Every broker message goes
//! through the same steps:
//!
//! ```text
//! RECEIVED → ledger check ─┬─ SUCCESS already ──────────────► ack (duplicate)
//!                          └─ begin PROCESSING → disaggregate → persist rows
//!                               → push WEBSOCKET rows (best effort)
//!                               → ledger SUCCESS → ack
//! any failure before ack   → ledger FAILED → nack(requeue)
//! malformed body           → nack(no requeue), straight to dead letter
//! ```
//!
//! Concurrent deliveries of the same event are made safe by the ledger and
//! the unique constraint on notification rows, not by locking here.

pub mod delivery;

pub use delivery::{InMemoryConnections, LiveConnectionRegistry, LivePush, PushError};

use chrono::Utc;
use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
use event_bus::{validate_payload_fields, Delivery, EventBus, NotificationEventPayload, QueueSpec};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::metrics::Metrics;
use crate::models::{Audience, Channel, ProcessedStatus};
use crate::orchestrator::{disaggregate, BlockedEventTypes, Orchestrator, OrchestratorError};
use crate::store::{
    BeginOutcome, InsertOutcome, NotificationStore, ProcessedEventStore, RecipientDirectory,
    StoreError,
};

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ListenerError {
    /// Retrying cannot fix these; the message goes to the dead letter path
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ListenerError::Malformed(_)
                | ListenerError::Orchestrator(OrchestratorError::MissingGroupKey { .. })
        )
    }
}

/// Everything a listener needs, injected once at startup
#[derive(Clone)]
pub struct ListenerCapabilities {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub directory: Arc<dyn RecipientDirectory>,
    pub ledger: Arc<dyn ProcessedEventStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub connections: Arc<dyn LiveConnectionRegistry>,
    pub metrics: Metrics,
    pub blocked: Arc<BlockedEventTypes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// The event already reached SUCCESS for this audience
    Duplicate,
    /// Nobody to notify; not an error
    EmptyAudience,
    Disaggregated {
        persisted: usize,
        /// Rows another delivery had already written
        duplicates: usize,
        pushed: usize,
    },
}

impl ListenerOutcome {
    fn label(&self) -> &'static str {
        match self {
            ListenerOutcome::Duplicate => "duplicate",
            ListenerOutcome::EmptyAudience => "empty",
            ListenerOutcome::Disaggregated { .. } => "disaggregated",
        }
    }
}

pub struct AudienceListener {
    caps: ListenerCapabilities,
    audience: Audience,
    retry: RetryConfig,
}

impl AudienceListener {
    pub fn new(caps: ListenerCapabilities) -> Self {
        let audience = caps.orchestrator.audience();
        Self {
            caps,
            audience,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(2),
            },
        }
    }

    /// In-process retry around row inserts, before the message is nacked
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn audience(&self) -> Audience {
        self.audience
    }

    pub fn queue(&self) -> QueueSpec {
        self.audience.queue()
    }

    /// Parse, handle and settle one delivery
    pub async fn process(&self, delivery: Delivery) -> Result<ListenerOutcome, ListenerError> {
        let span = tracing::info_span!(
            "notification_listener",
            audience = %self.audience,
            attempt = delivery.attempt(),
            event_id = tracing::field::Empty,
        );

        async move {
            let result = match parse(&delivery.message().payload) {
                Ok(payload) => {
                    tracing::Span::current().record("event_id", payload.event_id.as_str());
                    self.handle(&payload).await
                }
                Err(e) => Err(e),
            };

            let settled = match &result {
                Ok(outcome) => {
                    self.count(outcome.label());
                    tracing::debug!(outcome = ?outcome, "Message handled");
                    delivery.ack().await
                }
                Err(e) if e.is_malformed() => {
                    self.count("malformed");
                    tracing::error!(error = %e, "Malformed message, dead-lettering");
                    delivery.nack(false).await
                }
                Err(e) => {
                    self.count("requeued");
                    tracing::warn!(error = %e, "Message processing failed, requeueing");
                    delivery.nack(true).await
                }
            };

            if let Err(e) = settled {
                tracing::error!(error = %e, "Failed to settle message with the broker");
            }

            result
        }
        .instrument(span)
        .await
    }

    /// Run the idempotent pipeline for one event
    pub async fn handle(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<ListenerOutcome, ListenerError> {
        let ledger = &self.caps.ledger;
        let event_id = payload.event_id.as_str();

        if ledger.status(self.audience, event_id).await? == Some(ProcessedStatus::Success) {
            return Ok(self.duplicate(event_id));
        }

        if ledger
            .begin(self.audience, event_id, &payload.event_type)
            .await?
            == BeginOutcome::AlreadyProcessed
        {
            return Ok(self.duplicate(event_id));
        }

        match self.disaggregate_and_persist(payload).await {
            Ok(outcome) => {
                ledger.complete(self.audience, event_id).await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(ledger_error) = ledger.fail(self.audience, event_id, &e.to_string()).await
                {
                    tracing::error!(error = %ledger_error, "Failed to mark event FAILED in ledger");
                }
                Err(e)
            }
        }
    }

    async fn disaggregate_and_persist(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<ListenerOutcome, ListenerError> {
        let planned = disaggregate(
            self.caps.orchestrator.as_ref(),
            self.caps.directory.as_ref(),
            payload,
            &self.caps.blocked,
        )
        .await?;

        if planned.is_empty() {
            return Ok(ListenerOutcome::EmptyAudience);
        }

        let audience = self.audience.as_str();
        let mut persisted = 0;
        let mut duplicates = 0;
        let mut pushed = 0;

        for plan in planned {
            let new = plan.into_new_notification(self.audience, payload);
            let channel = new.channel;

            let inserted = retry_with_backoff(
                || self.caps.notifications.insert(new.clone()),
                &self.retry,
                "persist_notification",
            )
            .await;

            match inserted {
                Ok(InsertOutcome::Inserted(notification)) => {
                    persisted += 1;
                    self.caps
                        .metrics
                        .notifications_sent_total
                        .with_label_values(&[
                            audience,
                            channel.as_str(),
                            payload.event_type.as_str(),
                        ])
                        .inc();

                    if channel == Channel::WebSocket && self.push_live(&notification).await {
                        pushed += 1;
                    }
                }
                Ok(InsertOutcome::Duplicate) => {
                    duplicates += 1;
                    self.caps
                        .metrics
                        .notifications_duplicates_total
                        .with_label_values(&[audience])
                        .inc();
                }
                Err(e) => {
                    self.caps
                        .metrics
                        .notifications_failed_total
                        .with_label_values(&[
                            audience,
                            channel.as_str(),
                            payload.event_type.as_str(),
                            "persist",
                        ])
                        .inc();
                    return Err(e.into());
                }
            }
        }

        tracing::info!(persisted, duplicates, pushed, "Event disaggregated");

        Ok(ListenerOutcome::Disaggregated {
            persisted,
            duplicates,
            pushed,
        })
    }

    /// Best effort; returns whether the frame reached a live connection
    async fn push_live(&self, notification: &crate::models::Notification) -> bool {
        let connections = &self.caps.connections;
        if !connections
            .is_connected(self.audience, notification.recipient_id)
            .await
        {
            return false;
        }

        match connections
            .push(self.audience, notification.recipient_id, notification.into())
            .await
        {
            Ok(()) => {
                if let Err(e) = self
                    .caps
                    .notifications
                    .mark_delivered(notification.id, Utc::now())
                    .await
                {
                    tracing::warn!(
                        notification_id = notification.id,
                        error = %e,
                        "Pushed but failed to stamp delivered_at"
                    );
                }
                true
            }
            Err(e) => {
                self.caps
                    .metrics
                    .notifications_failed_total
                    .with_label_values(&[
                        self.audience.as_str(),
                        Channel::WebSocket.as_str(),
                        notification.event_type.as_str(),
                        "push",
                    ])
                    .inc();
                tracing::warn!(
                    notification_id = notification.id,
                    recipient_id = notification.recipient_id,
                    error = %e,
                    "Live push failed, client will pull on reconnect"
                );
                false
            }
        }
    }

    fn duplicate(&self, event_id: &str) -> ListenerOutcome {
        self.caps
            .metrics
            .notifications_duplicates_total
            .with_label_values(&[self.audience.as_str()])
            .inc();
        tracing::debug!(event_id = %event_id, "Event already processed, acknowledging");
        ListenerOutcome::Duplicate
    }

    fn count(&self, outcome: &str) {
        self.caps
            .metrics
            .listener_messages_total
            .with_label_values(&[self.audience.as_str(), outcome])
            .inc();
    }

    /// Consume `queue` until the stream ends
    pub fn spawn(self: Arc<Self>, bus: Arc<dyn EventBus>, queue: QueueSpec) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(audience = %self.audience, queue = %queue.name, "Starting audience listener");

            let mut deliveries = match bus.consume(&queue).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(queue = %queue.name, error = %e, "Failed to consume queue");
                    return;
                }
            };

            while let Some(delivery) = deliveries.next().await {
                // Outcome is already logged and settled
                let _ = self.process(delivery).await;
            }

            tracing::warn!(audience = %self.audience, "Audience listener stopped");
        })
    }
}

fn parse(body: &[u8]) -> Result<NotificationEventPayload, ListenerError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ListenerError::Malformed(format!("invalid JSON: {}", e)))?;
    validate_payload_fields(&value).map_err(ListenerError::Malformed)?;
    serde_json::from_value(value).map_err(|e| ListenerError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(matches!(parse(b"not json"), Err(ListenerError::Malformed(_))));
        assert!(matches!(
            parse(br#"{"event_id":"e","event_type":"X"}"#),
            Err(ListenerError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_wire_example() {
        let body = br#"{ "event_id": "evt_123", "event_type": "RESERVATION_NEW",
            "recipient_type": "RESTAURANT_TEAM", "recipient_id": 3,
            "restaurant_id": 3, "timestamp": "2025-01-20T14:30:00Z",
            "data": { "reservationId": 147, "partySize": 4 } }"#;

        let payload = parse(body).unwrap();
        assert_eq!(payload.event_id, "evt_123");
        assert_eq!(payload.restaurant_id, Some(3));
        assert_eq!(payload.data_i64("partySize"), Some(4));
    }

    #[test]
    fn test_missing_group_key_is_malformed() {
        let err = ListenerError::from(OrchestratorError::MissingGroupKey {
            audience: Audience::Agency,
            event_id: "e".to_string(),
        });
        assert!(err.is_malformed());
        assert!(!ListenerError::Store(StoreError::Unavailable("db".into())).is_malformed());
    }
}
