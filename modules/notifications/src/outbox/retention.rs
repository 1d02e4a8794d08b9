use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::refresh_outbox_gauges;
use crate::metrics::Metrics;
use crate::store::{OutboxStore, StoreError};

/// Deletes published outbox rows past their retention period
///
/// PENDING and FAILED rows are kept regardless of age.
pub struct RetentionJob {
    store: Arc<dyn OutboxStore>,
    metrics: Metrics,
    retention: chrono::Duration,
    interval: Duration,
    max_attempts: i32,
}

impl RetentionJob {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        metrics: Metrics,
        retention_days: i64,
        interval: Duration,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            metrics,
            retention: chrono::Duration::days(retention_days),
            interval,
            max_attempts,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = now - self.retention;
        let deleted = self.store.delete_processed_before(cutoff).await?;

        self.metrics.outbox_retention_deleted_total.inc_by(deleted);
        refresh_outbox_gauges(self.store.as_ref(), &self.metrics, self.max_attempts).await?;

        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "Outbox retention removed processed rows");
        }
        Ok(deleted)
    }

    pub async fn run(self) {
        tracing::info!(
            retention_days = self.retention.num_days(),
            interval_secs = self.interval.as_secs(),
            "Starting outbox retention job"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                tracing::error!(error = %e, "Outbox retention run failed");
            }
        }
    }
}
