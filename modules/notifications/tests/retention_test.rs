//! Outbox retention: only old PROCESSED rows are removed

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::Harness;
use notifications_rs::models::{NewOutboxEvent, OutboxStatus};
use notifications_rs::outbox::RetentionJob;
use notifications_rs::store::OutboxStore;
use serde_json::json;
use std::time::Duration;

fn job(h: &Harness) -> RetentionJob {
    RetentionJob::new(
        h.outbox_store.clone(),
        h.metrics.clone(),
        7,
        Duration::from_secs(3600),
        5,
    )
}

async fn append(h: &Harness, event_type: &str) -> i64 {
    h.outbox_store
        .append(NewOutboxEvent::new(
            "RESERVATION",
            Some(1),
            event_type,
            json!({ "recipient_type": "RESTAURANT", "restaurant_id": 1 }),
        ))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_retention_deletes_only_old_processed_rows() {
    let h = Harness::new();
    let now = Utc::now();
    let old = now - ChronoDuration::days(10);

    let old_processed = append(&h, "RESERVATION_NEW").await;
    let recent_processed = append(&h, "RESERVATION_CONFIRMED").await;
    let old_pending = append(&h, "RESERVATION_MODIFIED").await;
    let old_failed = append(&h, "RESERVATION_CANCELLED").await;

    h.outbox_store.mark_processed(old_processed, now).await.unwrap();
    h.outbox_store.mark_processed(recent_processed, now).await.unwrap();
    h.outbox_store
        .mark_failed(old_failed, "broker down", now)
        .await
        .unwrap();

    for id in [old_processed, old_pending, old_failed] {
        h.outbox_store.backdate(id, old);
    }

    let deleted = job(&h).run_once(now).await.unwrap();
    assert_eq!(deleted, 1);

    let remaining: Vec<(i64, OutboxStatus)> = h
        .outbox_store
        .rows()
        .into_iter()
        .map(|r| (r.id, r.status))
        .collect();
    assert_eq!(
        remaining,
        vec![
            (recent_processed, OutboxStatus::Processed),
            (old_pending, OutboxStatus::Pending),
            (old_failed, OutboxStatus::Failed),
        ]
    );

    assert_eq!(h.metrics.outbox_retention_deleted_total.get(), 1);
    assert_eq!(h.metrics.outbox_pending.get(), 1);
    assert_eq!(h.metrics.outbox_failed_retryable.get(), 1);
}

#[tokio::test]
async fn test_retention_with_nothing_to_delete() {
    let h = Harness::new();
    append(&h, "RESERVATION_NEW").await;

    assert_eq!(job(&h).run_once(Utc::now()).await.unwrap(), 0);
    assert_eq!(h.outbox_store.rows().len(), 1);
    assert_eq!(h.metrics.outbox_retention_deleted_total.get(), 0);
}

#[tokio::test]
async fn test_retention_surfaces_store_errors() {
    let h = Harness::new();
    h.outbox_store.set_available(false);

    assert!(job(&h).run_once(Utc::now()).await.is_err());
}
