//! Storage seams
//!
//! Every piece of state the pipeline touches sits behind one of these traits.
//! Postgres implementations live in [`crate::repos`]; the in-memory ones in
//! [`memory`] back the tests and local development.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    Audience, ChannelSet, NewNotification, NewOutboxEvent, Notification, OutboxEvent,
    ProcessedStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outbox row counts backing the outbox gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutboxCounts {
    pub pending: i64,
    pub failed_retryable: i64,
    /// Parked rows plus rows that exhausted their attempts
    pub dead: i64,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(&self, event: NewOutboxEvent) -> StoreResult<OutboxEvent>;

    async fn get(&self, id: i64) -> StoreResult<Option<OutboxEvent>>;

    /// PENDING rows plus FAILED rows that are due and under the attempt
    /// limit, oldest first
    async fn fetch_publishable(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        max_attempts: i32,
    ) -> StoreResult<Vec<OutboxEvent>>;

    async fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Record a failed publish; returns the new retry count
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<i32>;

    /// FAILED for good: never picked up again, kept for audit
    async fn park(&self, id: i64, error: &str) -> StoreResult<()>;

    /// Delete PROCESSED rows created before `cutoff`
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    async fn counts(&self, max_attempts: i32) -> StoreResult<OutboxCounts>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Ledger row is PROCESSING and this delivery owns the work
    Started,
    /// A previous delivery already finished the event
    AlreadyProcessed,
}

/// Idempotency ledger keyed by (audience, event_id)
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn status(&self, audience: Audience, event_id: &str)
        -> StoreResult<Option<ProcessedStatus>>;

    /// Upsert a PROCESSING row unless the event already reached SUCCESS
    async fn begin(
        &self,
        audience: Audience,
        event_id: &str,
        event_type: &str,
    ) -> StoreResult<BeginOutcome>;

    async fn complete(&self, audience: Audience, event_id: &str) -> StoreResult<()>;

    async fn fail(&self, audience: Audience, event_id: &str, error: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted(Notification),
    /// A row with the same (audience, event_id, recipient_id, channel) exists
    Duplicate,
}

/// Which unread notifications a shared read applies to
///
/// Group filters only touch shared rows, except the `*HubAll` ones which
/// also sweep personal rows under the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFilter {
    Notification(i64),
    Restaurant(i64),
    RestaurantHub(i64),
    RestaurantHubAll(i64),
    Agency(i64),
    AgencyHub(i64),
    AgencyHubAll(i64),
}

impl ReadFilter {
    pub fn matches(&self, n: &Notification) -> bool {
        let restaurant = n.audience == Audience::Restaurant;
        let agency = n.audience == Audience::Agency;

        match *self {
            ReadFilter::Notification(id) => n.id == id,
            ReadFilter::Restaurant(id) => {
                restaurant && n.shared_read && n.restaurant_id == Some(id)
            }
            ReadFilter::RestaurantHub(id) => restaurant && n.shared_read && n.hub_id == Some(id),
            ReadFilter::RestaurantHubAll(id) => restaurant && n.hub_id == Some(id),
            ReadFilter::Agency(id) => agency && n.shared_read && n.agency_id == Some(id),
            ReadFilter::AgencyHub(id) => agency && n.shared_read && n.hub_id == Some(id),
            ReadFilter::AgencyHubAll(id) => agency && n.hub_id == Some(id),
        }
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn insert(&self, notification: NewNotification) -> StoreResult<InsertOutcome>;

    async fn get(&self, id: i64) -> StoreResult<Option<Notification>>;

    async fn mark_delivered(&self, id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Mark every unread row matching `filter`; returns rows updated
    async fn mark_read(
        &self,
        filter: &ReadFilter,
        reader_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn count_for_event(&self, audience: Audience, event_id: &str) -> StoreResult<i64>;
}

/// A member of the recipient directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub id: i64,
    pub enabled: bool,
    pub hub_id: Option<i64>,
    /// Personal channel opt-ins
    pub channels: ChannelSet,
}

impl Recipient {
    pub fn new(id: i64, channels: ChannelSet) -> Self {
        Self {
            id,
            enabled: true,
            hub_id: None,
            channels,
        }
    }

    pub fn with_hub(mut self, hub_id: i64) -> Self {
        self.hub_id = Some(hub_id);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// The set of recipients an event is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientGroup {
    Customer(i64),
    /// All staff of a restaurant
    RestaurantStaff(i64),
    Admin(i64),
    AllAdmins,
    /// All users of an agency
    AgencyUsers(i64),
}

impl RecipientGroup {
    pub fn audience(&self) -> Audience {
        match self {
            RecipientGroup::Customer(_) => Audience::Customer,
            RecipientGroup::RestaurantStaff(_) => Audience::Restaurant,
            RecipientGroup::Admin(_) | RecipientGroup::AllAdmins => Audience::Admin,
            RecipientGroup::AgencyUsers(_) => Audience::Agency,
        }
    }

    /// Directory `group_id` to filter on, if any
    pub fn group_id(&self) -> Option<i64> {
        match *self {
            RecipientGroup::RestaurantStaff(id) | RecipientGroup::AgencyUsers(id) => Some(id),
            _ => None,
        }
    }

    /// Directory `recipient_id` to filter on, if any
    pub fn recipient_id(&self) -> Option<i64> {
        match *self {
            RecipientGroup::Customer(id) | RecipientGroup::Admin(id) => Some(id),
            _ => None,
        }
    }
}

/// Read-only view of group membership and channel preferences
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn resolve(&self, group: &RecipientGroup) -> StoreResult<Vec<Recipient>>;
}
