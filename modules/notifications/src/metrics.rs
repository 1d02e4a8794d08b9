use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::store::OutboxCounts;

/// Pipeline metrics, owned by one registry and shared by cloning
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Disaggregation
    pub notifications_sent_total: IntCounterVec,
    pub notifications_failed_total: IntCounterVec,
    pub notifications_duplicates_total: IntCounterVec,
    pub listener_messages_total: IntCounterVec,

    // Outbox
    pub outbox_processed_total: IntCounterVec,
    pub outbox_unroutable_total: IntCounter,
    pub outbox_retention_deleted_total: IntCounter,
    pub outbox_pending: IntGauge,
    pub outbox_failed_retryable: IntGauge,
    pub outbox_dead: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let notifications_sent_total = IntCounterVec::new(
            Opts::new("notifications_sent_total", "Notification rows persisted"),
            &["audience", "channel", "event_type"],
        )?;

        let notifications_failed_total = IntCounterVec::new(
            Opts::new(
                "notifications_failed_total",
                "Notification persistence or live delivery failures",
            ),
            &["audience", "channel", "event_type", "reason"], // reason: persist|push
        )?;

        let notifications_duplicates_total = IntCounterVec::new(
            Opts::new(
                "notifications_duplicates_total",
                "Redelivered events and rows absorbed by idempotency",
            ),
            &["audience"],
        )?;

        let listener_messages_total = IntCounterVec::new(
            Opts::new("listener_messages_total", "Broker messages settled by listeners"),
            &["audience", "outcome"], // disaggregated|duplicate|empty|malformed|requeued
        )?;

        let outbox_processed_total = IntCounterVec::new(
            Opts::new("outbox_processed_total", "Outbox publish attempts"),
            &["status"], // published|failed|dead
        )?;

        let outbox_unroutable_total = IntCounter::new(
            "outbox_unroutable_total",
            "Outbox rows parked because no audience could be derived",
        )?;

        let outbox_retention_deleted_total = IntCounter::new(
            "outbox_retention_deleted_total",
            "Processed outbox rows deleted by retention",
        )?;

        let outbox_pending = IntGauge::new("outbox_pending", "Outbox rows awaiting first publish")?;
        let outbox_failed_retryable = IntGauge::new(
            "outbox_failed_retryable",
            "Failed outbox rows still eligible for retry",
        )?;
        let outbox_dead = IntGauge::new(
            "outbox_dead",
            "Outbox rows parked or out of attempts (outbox DLQ)",
        )?;

        registry.register(Box::new(notifications_sent_total.clone()))?;
        registry.register(Box::new(notifications_failed_total.clone()))?;
        registry.register(Box::new(notifications_duplicates_total.clone()))?;
        registry.register(Box::new(listener_messages_total.clone()))?;
        registry.register(Box::new(outbox_processed_total.clone()))?;
        registry.register(Box::new(outbox_unroutable_total.clone()))?;
        registry.register(Box::new(outbox_retention_deleted_total.clone()))?;
        registry.register(Box::new(outbox_pending.clone()))?;
        registry.register(Box::new(outbox_failed_retryable.clone()))?;
        registry.register(Box::new(outbox_dead.clone()))?;

        Ok(Self {
            registry,
            notifications_sent_total,
            notifications_failed_total,
            notifications_duplicates_total,
            listener_messages_total,
            outbox_processed_total,
            outbox_unroutable_total,
            outbox_retention_deleted_total,
            outbox_pending,
            outbox_failed_retryable,
            outbox_dead,
        })
    }

    pub fn set_outbox_counts(&self, counts: &OutboxCounts) {
        self.outbox_pending.set(counts.pending);
        self.outbox_failed_retryable.set(counts.failed_retryable);
        self.outbox_dead.set(counts.dead);
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
