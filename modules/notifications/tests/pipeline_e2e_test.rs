//! End-to-end pipeline tests: outbox → publisher → broker → audience listener
//!
//! Runs entirely in memory. Covers the happy path, duplicate delivery,
//! a crash between broker ack and status flip, broker outage with backoff,
//! unroutable events and the post-commit publish path.

mod common;

use chrono::Utc;
use common::{add_staff, assert_no_delivery, next_delivery, Harness};
use notifications_rs::listener::ListenerOutcome;
use notifications_rs::models::{Audience, Channel, NewOutboxEvent, OutboxStatus};
use notifications_rs::outbox::{commit_hook, OutboxError, PublisherConfig};
use notifications_rs::store::{NotificationStore, OutboxStore};
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;

fn seed_restaurant_five(h: &Harness) {
    add_staff(h, 5, 11, &[Channel::Email]);
    add_staff(h, 5, 12, &[Channel::WebSocket]);
    add_staff(h, 5, 13, &[Channel::Email, Channel::WebSocket]);
}

async fn append_status_change(h: &Harness) -> String {
    let event = h
        .outbox()
        .append(
            "RESERVATION",
            Some(147),
            "RESERVATION_STATUS_CHANGED",
            json!({
                "recipient_type": "RESTAURANT",
                "restaurant_id": 5,
                "data": { "reservationId": 147, "status": "SEATED", "customerName": "Ada" }
            }),
        )
        .await
        .expect("append to outbox");
    event.event_id
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_reservation_event_fans_out_to_restaurant_staff() {
    let h = Harness::new();
    seed_restaurant_five(&h);
    let mut deliveries = h.consume(Audience::Restaurant).await;
    let listener = h.listener(Audience::Restaurant);

    let event_id = append_status_change(&h).await;

    let report = h.publisher().publish_pending(Utc::now()).await.unwrap();
    assert_eq!(report.published, 1);

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(
        delivery.message().subject,
        "notification.restaurant.reservation_status_changed"
    );
    let body = delivery.message().payload.clone();

    let outcome = listener.process(delivery).await.unwrap();
    assert_eq!(
        outcome,
        ListenerOutcome::Disaggregated {
            persisted: 4,
            duplicates: 0,
            pushed: 0
        }
    );

    let pairs: BTreeSet<(i64, Channel)> = h
        .notifications
        .all()
        .iter()
        .map(|n| (n.recipient_id, n.channel))
        .collect();
    let expected: BTreeSet<(i64, Channel)> = [
        (11, Channel::Email),
        (12, Channel::WebSocket),
        (13, Channel::Email),
        (13, Channel::WebSocket),
    ]
    .into_iter()
    .collect();
    assert_eq!(pairs, expected);

    let rows = h.outbox_store.rows();
    assert_eq!(rows[0].status, OutboxStatus::Processed);
    assert!(rows[0].published_at.is_some());

    // Same body delivered again: acknowledged, nothing new written
    h.publish_raw("notification.restaurant.reservation_status_changed", &body)
        .await;
    let redelivered = next_delivery(&mut deliveries).await;
    assert_eq!(
        listener.process(redelivered).await.unwrap(),
        ListenerOutcome::Duplicate
    );
    assert_eq!(
        h.notifications
            .count_for_event(Audience::Restaurant, &event_id)
            .await
            .unwrap(),
        4
    );
}

#[tokio::test]
async fn test_broker_body_carries_outbox_identity() {
    let h = Harness::new();
    let mut deliveries = h.consume(Audience::Restaurant).await;

    let event_id = append_status_change(&h).await;
    h.publisher().publish_pending(Utc::now()).await.unwrap();

    let delivery = next_delivery(&mut deliveries).await;
    let body: serde_json::Value = serde_json::from_slice(&delivery.message().payload).unwrap();
    delivery.ack().await.unwrap();

    assert_eq!(body["event_id"], event_id);
    assert_eq!(body["event_type"], "RESERVATION_STATUS_CHANGED");
    assert_eq!(body["recipient_type"], "RESTAURANT");
    assert_eq!(body["restaurant_id"], 5);
    assert_eq!(body["data"]["reservationId"], 147);
}

// ============================================================================
// Failure injection
// ============================================================================

#[tokio::test]
async fn test_crash_before_status_flip_republishes_without_duplicates() {
    let h = Harness::new();
    seed_restaurant_five(&h);
    let mut deliveries = h.consume(Audience::Restaurant).await;
    let listener = h.listener(Audience::Restaurant);
    let publisher = h.publisher();

    let event_id = append_status_change(&h).await;

    h.outbox_store.fail_next_mark_processed(1);
    let first = publisher.publish_pending(Utc::now()).await;
    assert!(matches!(first, Err(OutboxError::Store(_))));
    assert_eq!(h.outbox_store.rows()[0].status, OutboxStatus::Pending);

    let second = publisher.publish_pending(Utc::now()).await.unwrap();
    assert_eq!(second.published, 1);
    assert_eq!(h.outbox_store.rows()[0].status, OutboxStatus::Processed);

    // The broker holds two copies of the same event
    let copy_one = next_delivery(&mut deliveries).await;
    let copy_two = next_delivery(&mut deliveries).await;

    assert!(matches!(
        listener.process(copy_one).await.unwrap(),
        ListenerOutcome::Disaggregated { persisted: 4, .. }
    ));
    assert_eq!(
        listener.process(copy_two).await.unwrap(),
        ListenerOutcome::Duplicate
    );
    assert_eq!(
        h.notifications
            .count_for_event(Audience::Restaurant, &event_id)
            .await
            .unwrap(),
        4
    );
}

#[tokio::test]
async fn test_broker_outage_reschedules_with_backoff() {
    let h = Harness::new();
    let mut deliveries = h.consume(Audience::Restaurant).await;
    let publisher = h.publisher();
    let now = Utc::now();

    append_status_change(&h).await;

    h.bus.set_available(false);
    let report = publisher.publish_pending(now).await.unwrap();
    assert_eq!(report.failed, 1);

    let row = h.outbox_store.rows().remove(0);
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert!(row.last_error.is_some());
    assert!(row.next_attempt_at.unwrap() > now);
    assert_eq!(h.metrics.outbox_failed_retryable.get(), 1);

    // Not due yet, even with the broker back
    h.bus.set_available(true);
    let report = publisher.publish_pending(now).await.unwrap();
    assert_eq!(report.published, 0);
    assert_no_delivery(&mut deliveries).await;

    let later = now + chrono::Duration::seconds(1);
    let report = publisher.publish_pending(later).await.unwrap();
    assert_eq!(report.published, 1);

    let delivery = next_delivery(&mut deliveries).await;
    delivery.ack().await.unwrap();
    assert_eq!(h.outbox_store.rows()[0].status, OutboxStatus::Processed);
    assert_eq!(h.metrics.outbox_failed_retryable.get(), 0);
}

#[tokio::test]
async fn test_exhausted_row_stops_being_published() {
    let h = Harness::new();
    let publisher = h.publisher_with(PublisherConfig {
        max_attempts: 2,
        ..PublisherConfig::default()
    });
    let now = Utc::now();
    let hours = |n| now + chrono::Duration::hours(n);

    append_status_change(&h).await;
    h.bus.set_available(false);

    assert_eq!(publisher.publish_pending(now).await.unwrap().failed, 1);
    assert_eq!(publisher.publish_pending(hours(1)).await.unwrap().failed, 1);
    let report = publisher.publish_pending(hours(2)).await.unwrap();
    assert_eq!(report.failed, 0, "dead row must not be picked up again");
    assert_eq!(h.outbox_store.rows()[0].retry_count, 2);

    let counts = h.outbox_store.counts(2).await.unwrap();
    assert_eq!(counts.dead, 1);
    assert_eq!(h.metrics.outbox_dead.get(), 1);
}

// ============================================================================
// Unroutable events
// ============================================================================

#[tokio::test]
async fn test_unroutable_row_is_parked_and_counted() {
    let h = Harness::new();
    let publisher = h.publisher();

    // Bypasses the fail-fast check in Outbox::append
    h.outbox_store
        .append(NewOutboxEvent::new(
            "INVOICE",
            Some(1),
            "INVOICE_PAID",
            json!({}),
        ))
        .await
        .unwrap();

    let report = publisher.publish_pending(Utc::now()).await.unwrap();
    assert_eq!(report.unroutable, 1);
    assert_eq!(report.published, 0);

    let row = h.outbox_store.rows().remove(0);
    assert!(row.is_parked());
    assert!(row.last_error.unwrap().contains("INVOICE"));
    assert_eq!(h.metrics.outbox_unroutable_total.get(), 1);
    assert_eq!(h.metrics.outbox_dead.get(), 1);

    let report = publisher.publish_pending(Utc::now()).await.unwrap();
    assert_eq!(report.unroutable, 0);
}

#[tokio::test]
async fn test_unroutable_append_is_rejected() {
    let h = Harness::new();

    let result = h
        .outbox()
        .append("INVOICE", Some(1), "INVOICE_PAID", json!({ "recipient_type": "" }))
        .await;

    assert!(matches!(result, Err(OutboxError::UnroutableEvent { .. })));
    assert!(h.outbox_store.rows().is_empty());
}

// ============================================================================
// Post-commit publish
// ============================================================================

#[tokio::test]
async fn test_commit_hook_publishes_without_waiting_for_sweep() {
    let h = Harness::new();
    let mut deliveries = h.consume(Audience::Restaurant).await;

    let (hook, committed) = commit_hook();
    let outbox = h.outbox().with_commit_hook(hook);
    let publisher = h.publisher_with(PublisherConfig {
        sweep_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    let task = tokio::spawn(publisher.run(committed));

    // Let the immediate first sweep run against the empty outbox
    tokio::time::sleep(Duration::from_millis(20)).await;

    outbox
        .append(
            "RESERVATION",
            Some(9),
            "RESERVATION_NEW",
            json!({ "recipient_type": "RESTAURANT_TEAM", "restaurant_id": 3 }),
        )
        .await
        .unwrap();

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.message().subject, "notification.restaurant.reservation_new");
    delivery.ack().await.unwrap();
    assert_no_delivery(&mut deliveries).await;

    assert_eq!(h.outbox_store.rows()[0].status, OutboxStatus::Processed);
    task.abort();
}
