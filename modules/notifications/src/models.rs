use chrono::{DateTime, Utc};
use event_bus::QueueSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Text that does not name a known enum variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// ============================================================================
// AUDIENCES & CHANNELS
// ============================================================================

/// Top-level recipient category; selects the orchestrator and the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Customer,
    Restaurant,
    Admin,
    Agency,
}

impl Audience {
    pub const ALL: [Audience; 4] = [
        Audience::Customer,
        Audience::Restaurant,
        Audience::Admin,
        Audience::Agency,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Customer => "customer",
            Audience::Restaurant => "restaurant",
            Audience::Admin => "admin",
            Audience::Agency => "agency",
        }
    }

    /// Map a recipient/aggregate discriminator onto its audience
    ///
    /// Returns `None` for anything outside the fixed mapping; callers must
    /// treat that as a configuration error rather than guess.
    pub fn from_recipient_type(recipient_type: &str) -> Option<Self> {
        match recipient_type.trim().to_ascii_uppercase().as_str() {
            "CUSTOMER" => Some(Audience::Customer),
            "RESTAURANT" | "RESTAURANT_OWNER" | "RESTAURANT_STAFF" | "RESTAURANT_TEAM"
            | "RESTAURANT_USER" => Some(Audience::Restaurant),
            "ADMIN" | "ADMIN_USER" => Some(Audience::Admin),
            "AGENCY" | "AGENCY_USER" => Some(Audience::Agency),
            _ => None,
        }
    }

    /// Durable queue consumed by this audience's listener
    pub fn queue(&self) -> QueueSpec {
        QueueSpec::new(
            format!("notifications.{}", self.as_str()),
            format!("notification.{}.>", self.as_str()),
        )
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Audience {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Audience::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("audience", s))
    }
}

/// Broker routing key: `notification.<audience>.<event_type lowercase>`
pub fn routing_key(audience: Audience, event_type: &str) -> String {
    format!(
        "notification.{}.{}",
        audience.as_str(),
        event_type.trim().to_ascii_lowercase()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
    WebSocket,
    Slack,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Sms,
        Channel::Push,
        Channel::WebSocket,
        Channel::Slack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
            Channel::Push => "PUSH",
            Channel::WebSocket => "WEBSOCKET",
            Channel::Slack => "SLACK",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Channel::ALL
            .into_iter()
            .find(|c| c.as_str() == upper)
            .ok_or_else(|| ParseEnumError::new("channel", s))
    }
}

pub type ChannelSet = BTreeSet<Channel>;

pub fn channel_set(channels: &[Channel]) -> ChannelSet {
    channels.iter().copied().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        }
    }
}

// ============================================================================
// OUTBOX
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processed => "PROCESSED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "PROCESSED" => Ok(OutboxStatus::Processed),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(ParseEnumError::new("outbox status", other)),
        }
    }
}

/// Durable record of a business fact awaiting publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_id: String,
    pub aggregate_type: String,
    /// Absent when the fact has no applicable aggregate
    pub aggregate_id: Option<i64>,
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    /// Earliest time a FAILED row may be retried; `None` on a FAILED row
    /// means it is parked for good
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_parked(&self) -> bool {
        self.status == OutboxStatus::Failed && self.next_attempt_at.is_none()
    }

    /// Whether the publisher may pick this row up at `now`
    pub fn is_publishable(&self, now: DateTime<Utc>, max_attempts: i32) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Processed => false,
            OutboxStatus::Failed => {
                self.retry_count < max_attempts
                    && self.next_attempt_at.is_some_and(|at| at <= now)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: Option<i64>,
    pub event_type: String,
    pub payload: Value,
}

impl NewOutboxEvent {
    /// New event with a freshly generated `event_id`
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Option<i64>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }
}

/// Typed view of the JSON snapshot stored in `event_outbox.payload`
///
/// Business code writes snake_case keys; the camelCase spellings used by
/// older producers are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboxPayload {
    #[serde(default, alias = "recipientType", skip_serializing_if = "Option::is_none")]
    pub recipient_type: Option<String>,

    #[serde(default, alias = "recipientId", skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,

    #[serde(default, alias = "restaurantId", skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<i64>,

    #[serde(default, alias = "customerId", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,

    #[serde(default, alias = "agencyId", skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<i64>,

    #[serde(default, alias = "adminId", skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<i64>,

    #[serde(default)]
    pub data: Map<String, Value>,
}

// ============================================================================
// IDEMPOTENCY LEDGER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessedStatus {
    Processing,
    Success,
    Failed,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedStatus::Processing => "PROCESSING",
            ProcessedStatus::Success => "SUCCESS",
            ProcessedStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for ProcessedStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESSING" => Ok(ProcessedStatus::Processing),
            "SUCCESS" => Ok(ProcessedStatus::Success),
            "FAILED" => Ok(ProcessedStatus::Failed),
            other => Err(ParseEnumError::new("processed status", other)),
        }
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// A persisted notification owned by exactly one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub audience: Audience,
    pub event_id: String,
    pub event_type: String,
    pub recipient_id: i64,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
    pub restaurant_id: Option<i64>,
    pub hub_id: Option<i64>,
    pub agency_id: Option<i64>,
    /// Shared rows are read for the whole group; personal rows only by id
    pub shared_read: bool,
    pub read: bool,
    pub read_by: Option<i64>,
    pub read_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub audience: Audience,
    pub event_id: String,
    pub event_type: String,
    pub recipient_id: i64,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
    pub restaurant_id: Option<i64>,
    pub hub_id: Option<i64>,
    pub agency_id: Option<i64>,
    pub shared_read: bool,
}

impl NewNotification {
    /// The identity the unique constraint is declared on
    pub fn dedup_key(&self) -> (Audience, &str, i64, Channel) {
        (self.audience, &self.event_id, self.recipient_id, self.channel)
    }
}
