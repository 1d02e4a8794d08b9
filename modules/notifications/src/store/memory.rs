//! In-memory store implementations
//!
//! Same contracts as the Postgres repositories, including the unique
//! constraints. Each store can be switched to "unavailable" to exercise the
//! transient-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    BeginOutcome, InsertOutcome, NotificationStore, OutboxCounts, OutboxStore,
    ProcessedEventStore, ReadFilter, Recipient, RecipientDirectory, RecipientGroup, StoreError,
    StoreResult,
};
use crate::models::{
    Audience, NewNotification, NewOutboxEvent, Notification, OutboxEvent, OutboxStatus,
    ProcessedStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_available(flag: &AtomicBool, store: &str) -> StoreResult<()> {
    if flag.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!("{} is unavailable", store)))
    }
}

// ============================================================================
// OUTBOX
// ============================================================================

#[derive(Default)]
struct OutboxRows {
    next_id: i64,
    rows: BTreeMap<i64, OutboxEvent>,
}

pub struct InMemoryOutboxStore {
    state: Mutex<OutboxRows>,
    available: AtomicBool,
    failing_marks: AtomicU32,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutboxRows::default()),
            available: AtomicBool::new(true),
            failing_marks: AtomicU32::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` `mark_processed` calls fail, as if the process
    /// crashed between the broker ack and the status flip
    pub fn fail_next_mark_processed(&self, n: u32) {
        self.failing_marks.store(n, Ordering::SeqCst);
    }

    /// Snapshot of every row, oldest first
    pub fn rows(&self) -> Vec<OutboxEvent> {
        lock(&self.state).rows.values().cloned().collect()
    }

    /// Rewrite a row's creation time
    pub fn backdate(&self, id: i64, created_at: DateTime<Utc>) {
        if let Some(row) = lock(&self.state).rows.get_mut(&id) {
            row.created_at = created_at;
        }
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent> {
        check_available(&self.available, "outbox store")?;
        let mut state = lock(&self.state);

        if state.rows.values().any(|r| r.event_id == event.event_id) {
            return Err(StoreError::Conflict(format!(
                "duplicate event_id {}",
                event.event_id
            )));
        }

        state.next_id += 1;
        let row = OutboxEvent {
            id: state.next_id,
            event_id: event.event_id,
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: None,
            created_at: Utc::now(),
            published_at: None,
        };
        state.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get(&self, id: i64) -> StoreResult<Option<OutboxEvent>> {
        check_available(&self.available, "outbox store")?;
        Ok(lock(&self.state).rows.get(&id).cloned())
    }

    async fn fetch_publishable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        max_attempts: i32,
    ) -> StoreResult<Vec<OutboxEvent>> {
        check_available(&self.available, "outbox store")?;
        let state = lock(&self.state);

        let mut rows: Vec<OutboxEvent> = state
            .rows
            .values()
            .filter(|r| r.is_publishable(now, max_attempts))
            .cloned()
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        check_available(&self.available, "outbox store")?;
        let failing = self.failing_marks.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_marks.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(
                "connection lost before status flip".to_string(),
            ));
        }

        if let Some(row) = lock(&self.state).rows.get_mut(&id) {
            row.status = OutboxStatus::Processed;
            row.published_at = Some(at);
            row.next_attempt_at = None;
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<i32> {
        check_available(&self.available, "outbox store")?;
        let mut state = lock(&self.state);
        let row = state
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Corrupt(format!("outbox row {} vanished", id)))?;

        row.status = OutboxStatus::Failed;
        row.retry_count += 1;
        row.last_error = Some(error.to_string());
        row.next_attempt_at = Some(next_attempt_at);
        Ok(row.retry_count)
    }

    async fn park(&self, id: i64, error: &str) -> StoreResult<()> {
        check_available(&self.available, "outbox store")?;
        if let Some(row) = lock(&self.state).rows.get_mut(&id) {
            row.status = OutboxStatus::Failed;
            row.last_error = Some(error.to_string());
            row.next_attempt_at = None;
        }
        Ok(())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        check_available(&self.available, "outbox store")?;
        let mut state = lock(&self.state);
        let before = state.rows.len();
        state
            .rows
            .retain(|_, r| !(r.status == OutboxStatus::Processed && r.created_at < cutoff));
        Ok((before - state.rows.len()) as u64)
    }

    async fn counts(&self, max_attempts: i32) -> StoreResult<OutboxCounts> {
        check_available(&self.available, "outbox store")?;
        let state = lock(&self.state);

        let mut counts = OutboxCounts::default();
        for row in state.rows.values() {
            match row.status {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Processed => {}
                OutboxStatus::Failed => {
                    if row.is_parked() || row.retry_count >= max_attempts {
                        counts.dead += 1;
                    } else {
                        counts.failed_retryable += 1;
                    }
                }
            }
        }
        Ok(counts)
    }
}

// ============================================================================
// IDEMPOTENCY LEDGER
// ============================================================================

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event_type: String,
    pub status: ProcessedStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

pub struct InMemoryProcessedEvents {
    rows: Mutex<HashMap<(Audience, String), LedgerEntry>>,
    available: AtomicBool,
}

impl InMemoryProcessedEvents {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn entry(&self, audience: Audience, event_id: &str) -> Option<LedgerEntry> {
        lock(&self.rows)
            .get(&(audience, event_id.to_string()))
            .cloned()
    }

    fn set_status(
        &self,
        audience: Audience,
        event_id: &str,
        status: ProcessedStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        check_available(&self.available, "processed events store")?;
        if let Some(entry) = lock(&self.rows).get_mut(&(audience, event_id.to_string())) {
            entry.status = status;
            entry.last_error = error.map(str::to_string);
        }
        Ok(())
    }
}

impl Default for InMemoryProcessedEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEvents {
    async fn status(
        &self,
        audience: Audience,
        event_id: &str,
    ) -> StoreResult<Option<ProcessedStatus>> {
        check_available(&self.available, "processed events store")?;
        Ok(lock(&self.rows)
            .get(&(audience, event_id.to_string()))
            .map(|e| e.status))
    }

    async fn begin(
        &self,
        audience: Audience,
        event_id: &str,
        event_type: &str,
    ) -> StoreResult<BeginOutcome> {
        check_available(&self.available, "processed events store")?;
        let mut rows = lock(&self.rows);

        match rows.get_mut(&(audience, event_id.to_string())) {
            Some(entry) if entry.status == ProcessedStatus::Success => {
                Ok(BeginOutcome::AlreadyProcessed)
            }
            Some(entry) => {
                entry.status = ProcessedStatus::Processing;
                entry.attempts += 1;
                Ok(BeginOutcome::Started)
            }
            None => {
                rows.insert(
                    (audience, event_id.to_string()),
                    LedgerEntry {
                        event_type: event_type.to_string(),
                        status: ProcessedStatus::Processing,
                        attempts: 1,
                        last_error: None,
                    },
                );
                Ok(BeginOutcome::Started)
            }
        }
    }

    async fn complete(&self, audience: Audience, event_id: &str) -> StoreResult<()> {
        self.set_status(audience, event_id, ProcessedStatus::Success, None)
    }

    async fn fail(&self, audience: Audience, event_id: &str, error: &str) -> StoreResult<()> {
        self.set_status(audience, event_id, ProcessedStatus::Failed, Some(error))
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

#[derive(Default)]
struct NotificationRows {
    next_id: i64,
    rows: BTreeMap<i64, Notification>,
}

pub struct InMemoryNotificationStore {
    state: Mutex<NotificationRows>,
    available: AtomicBool,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NotificationRows::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Notification> {
        lock(&self.state).rows.values().cloned().collect()
    }
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn insert(&self, new: NewNotification) -> StoreResult<InsertOutcome> {
        check_available(&self.available, "notification store")?;
        let mut state = lock(&self.state);

        let key = new.dedup_key();
        let exists = state.rows.values().any(|n| {
            (n.audience, n.event_id.as_str(), n.recipient_id, n.channel) == key
        });
        if exists {
            return Ok(InsertOutcome::Duplicate);
        }

        state.next_id += 1;
        let row = Notification {
            id: state.next_id,
            audience: new.audience,
            event_id: new.event_id,
            event_type: new.event_type,
            recipient_id: new.recipient_id,
            channel: new.channel,
            title: new.title,
            body: new.body,
            metadata: new.metadata,
            restaurant_id: new.restaurant_id,
            hub_id: new.hub_id,
            agency_id: new.agency_id,
            shared_read: new.shared_read,
            read: false,
            read_by: None,
            read_at: None,
            delivered_at: None,
            created_at: Utc::now(),
        };
        state.rows.insert(row.id, row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn get(&self, id: i64) -> StoreResult<Option<Notification>> {
        check_available(&self.available, "notification store")?;
        Ok(lock(&self.state).rows.get(&id).cloned())
    }

    async fn mark_delivered(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        check_available(&self.available, "notification store")?;
        if let Some(row) = lock(&self.state).rows.get_mut(&id) {
            row.delivered_at = Some(at);
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        filter: &ReadFilter,
        reader_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        check_available(&self.available, "notification store")?;
        let mut state = lock(&self.state);

        let mut updated = 0;
        for row in state.rows.values_mut() {
            if !row.read && filter.matches(row) {
                row.read = true;
                row.read_by = Some(reader_id);
                row.read_at = Some(at);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_for_event(&self, audience: Audience, event_id: &str) -> StoreResult<i64> {
        check_available(&self.available, "notification store")?;
        Ok(lock(&self.state)
            .rows
            .values()
            .filter(|n| n.audience == audience && n.event_id == event_id)
            .count() as i64)
    }
}

// ============================================================================
// RECIPIENT DIRECTORY
// ============================================================================

#[derive(Default)]
pub struct InMemoryDirectory {
    members: Mutex<Vec<(Audience, Option<i64>, Recipient)>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member; `group_id` is the restaurant or agency, `None` for
    /// customers and admins
    pub fn add(&self, audience: Audience, group_id: Option<i64>, recipient: Recipient) {
        lock(&self.members).push((audience, group_id, recipient));
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryDirectory {
    async fn resolve(&self, group: &RecipientGroup) -> StoreResult<Vec<Recipient>> {
        let audience = group.audience();
        let group_id = group.group_id();
        let recipient_id = group.recipient_id();

        Ok(lock(&self.members)
            .iter()
            .filter(|(a, g, r)| {
                *a == audience
                    && group_id.map_or(true, |id| *g == Some(id))
                    && recipient_id.map_or(true, |id| r.id == id)
            })
            .map(|(_, _, r)| r.clone())
            .collect())
    }
}
