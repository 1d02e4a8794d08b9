use chrono::{DateTime, Utc};
use event_bus::consumer_retry::RetryConfig;
use event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{broker_payload, next_attempt_at, outbox_payload, resolve_route, OutboxError};
use crate::metrics::Metrics;
use crate::models::OutboxEvent;
use crate::store::OutboxStore;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: i64,
    /// Failed publishes allowed per row before it is dead
    pub max_attempts: i32,
    pub sweep_interval: Duration,
    /// Delay schedule between failed publishes; `max_attempts` is unused here
    pub backoff: RetryConfig,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            sweep_interval: Duration::from_secs(1),
            backoff: RetryConfig {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(60),
            },
        }
    }
}

/// Result of one publish attempt for one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishAttempt {
    Published,
    /// Broker refused; the row is FAILED and due again at `next_attempt_at`
    Rescheduled { retry_count: i32 },
    /// Broker refused for the last allowed time
    Dead { retry_count: i32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub failed: usize,
    pub unroutable: usize,
}

/// Forwards outbox rows to the broker
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    metrics: Metrics,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        metrics: Metrics,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            bus,
            metrics,
            config,
        }
    }

    /// Sweep: publish every due row, oldest first
    ///
    /// Unroutable rows are parked and counted but do not stop the batch.
    /// Store errors abort the batch; the rows stay due for the next sweep.
    pub async fn publish_pending(&self, now: DateTime<Utc>) -> Result<PublishReport, OutboxError> {
        let events = self
            .store
            .fetch_publishable(now, self.config.batch_size, self.config.max_attempts)
            .await?;

        let mut report = PublishReport::default();

        for event in &events {
            match self.publish_one(event, now).await {
                Ok(PublishAttempt::Published) => report.published += 1,
                Ok(PublishAttempt::Rescheduled { .. } | PublishAttempt::Dead { .. }) => {
                    report.failed += 1
                }
                Err(OutboxError::UnroutableEvent { .. }) => report.unroutable += 1,
                Err(e) => return Err(e),
            }
        }

        if let Err(e) =
            super::refresh_outbox_gauges(self.store.as_ref(), &self.metrics, self.config.max_attempts)
                .await
        {
            tracing::warn!(error = %e, "Failed to refresh outbox gauges");
        }

        Ok(report)
    }

    /// Publish one row and record the outcome on it
    pub async fn publish_one(
        &self,
        event: &OutboxEvent,
        now: DateTime<Utc>,
    ) -> Result<PublishAttempt, OutboxError> {
        let routed = outbox_payload(event).and_then(|payload| {
            resolve_route(&event.aggregate_type, &event.event_type, &payload)
                .map(|route| (route, payload))
                .map_err(|reason| OutboxError::UnroutableEvent {
                    event_id: event.event_id.clone(),
                    reason,
                })
        });

        let (route, payload) = match routed {
            Ok(routed) => routed,
            Err(e) => {
                self.store.park(event.id, &e.to_string()).await?;
                self.metrics.outbox_unroutable_total.inc();
                tracing::error!(
                    outbox_id = event.id,
                    event_id = %event.event_id,
                    aggregate_type = %event.aggregate_type,
                    error = %e,
                    "Unroutable outbox event parked"
                );
                return Err(e);
            }
        };

        let body = serde_json::to_vec(&broker_payload(event, payload))?;

        match self.bus.publish(&route.subject, body).await {
            Ok(()) => {
                self.store.mark_processed(event.id, now).await?;
                self.metrics
                    .outbox_processed_total
                    .with_label_values(&["published"])
                    .inc();

                tracing::debug!(
                    outbox_id = event.id,
                    event_id = %event.event_id,
                    subject = %route.subject,
                    "Outbox event published"
                );
                Ok(PublishAttempt::Published)
            }
            Err(e) => {
                let next = next_attempt_at(now, &self.config.backoff, event.retry_count + 1);
                let retry_count = self.store.mark_failed(event.id, &e.to_string(), next).await?;

                if retry_count >= self.config.max_attempts {
                    self.metrics
                        .outbox_processed_total
                        .with_label_values(&["dead"])
                        .inc();
                    tracing::error!(
                        outbox_id = event.id,
                        event_id = %event.event_id,
                        retry_count,
                        error = %e,
                        "Outbox event exhausted its publish attempts"
                    );
                    Ok(PublishAttempt::Dead { retry_count })
                } else {
                    self.metrics
                        .outbox_processed_total
                        .with_label_values(&["failed"])
                        .inc();
                    tracing::warn!(
                        outbox_id = event.id,
                        event_id = %event.event_id,
                        retry_count,
                        max_attempts = self.config.max_attempts,
                        next_attempt_at = %next,
                        error = %e,
                        "Failed to publish outbox event, rescheduled"
                    );
                    Ok(PublishAttempt::Rescheduled { retry_count })
                }
            }
        }
    }

    /// Publish a row named by the commit hook, if it is still due
    pub async fn publish_committed(
        &self,
        outbox_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<PublishAttempt>, OutboxError> {
        match self.store.get(outbox_id).await? {
            Some(event) if event.is_publishable(now, self.config.max_attempts) => {
                self.publish_one(&event, now).await.map(Some)
            }
            _ => {
                tracing::debug!(outbox_id, "Committed row no longer due, skipping");
                Ok(None)
            }
        }
    }

    /// Publisher loop: commit hook signals plus the periodic sweep
    pub async fn run(self, mut committed: mpsc::UnboundedReceiver<i64>) {
        tracing::info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox publisher"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        let mut hooks_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.publish_pending(Utc::now()).await {
                        Ok(report) if report.published + report.failed + report.unroutable > 0 => {
                            tracing::info!(
                                published = report.published,
                                failed = report.failed,
                                unroutable = report.unroutable,
                                "Outbox sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Outbox sweep failed"),
                    }
                }
                id = committed.recv(), if hooks_open => {
                    match id {
                        Some(id) => {
                            if let Err(e) = self.publish_committed(id, Utc::now()).await {
                                tracing::warn!(
                                    outbox_id = id,
                                    error = %e,
                                    "Post-commit publish failed, leaving row for the sweep"
                                );
                            }
                        }
                        None => {
                            tracing::debug!("Commit hook channel closed, sweep only");
                            hooks_open = false;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutboxStatus;
    use crate::outbox::Outbox;
    use crate::store::memory::InMemoryOutboxStore;
    use event_bus::{InMemoryBus, QueueSpec};
    use futures::StreamExt;
    use serde_json::json;

    fn publisher(store: Arc<InMemoryOutboxStore>, bus: Arc<InMemoryBus>) -> OutboxPublisher {
        OutboxPublisher::new(
            store,
            bus,
            Metrics::new().unwrap(),
            PublisherConfig {
                max_attempts: 2,
                ..PublisherConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_publishes_to_audience_subject() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let mut deliveries = bus
            .consume(&QueueSpec::new("observer", "notification.>"))
            .await
            .unwrap();

        Outbox::new(store.clone())
            .append(
                "CUSTOMER",
                Some(12),
                "ORDER_READY",
                json!({ "customer_id": 12, "data": { "orderId": 3 } }),
            )
            .await
            .unwrap();

        let report = publisher(store.clone(), bus).publish_pending(Utc::now()).await.unwrap();
        assert_eq!(report.published, 1);

        let delivery = deliveries.next().await.unwrap();
        assert_eq!(delivery.message().subject, "notification.customer.order_ready");
        assert_eq!(store.rows()[0].status, OutboxStatus::Processed);
    }

    #[tokio::test]
    async fn test_broker_failures_end_dead() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let bus = Arc::new(InMemoryBus::new());
        bus.set_available(false);
        let publisher = publisher(store.clone(), bus);

        let event = Outbox::new(store.clone())
            .append("ADMIN", None, "SYSTEM_ALERT", json!({}))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(
            publisher.publish_one(&event, now).await.unwrap(),
            PublishAttempt::Rescheduled { retry_count: 1 }
        );

        let row = store.rows().remove(0);
        assert_eq!(
            publisher.publish_one(&row, now).await.unwrap(),
            PublishAttempt::Dead { retry_count: 2 }
        );

        let later = now + chrono::Duration::hours(1);
        let report = publisher.publish_pending(later).await.unwrap();
        assert_eq!(report, PublishReport::default());
        assert_eq!(store.counts(2).await.unwrap().dead, 1);
    }

    #[tokio::test]
    async fn test_committed_row_already_processed_is_skipped() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let bus = Arc::new(InMemoryBus::new());
        let publisher = publisher(store.clone(), bus);

        let event = Outbox::new(store.clone())
            .append("AGENCY", Some(4), "NEW_BOOKING", json!({ "agency_id": 4 }))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(
            publisher.publish_committed(event.id, now).await.unwrap(),
            Some(PublishAttempt::Published)
        );
        assert_eq!(publisher.publish_committed(event.id, now).await.unwrap(), None);
    }
}
