//! # Notification Event Payload
//!
//! The broker message body exchanged between the outbox publisher and the
//! audience listeners.
//!
//! ## Fields
//!
//! - `event_id`: Globally unique, immutable; the idempotency key for every consumer
//! - `event_type`: Domain event name (e.g. `RESERVATION_STATUS_CHANGED`)
//! - `recipient_type`: Audience discriminator (e.g. `RESTAURANT_TEAM`, `CUSTOMER`)
//! - `recipient_id`: Optional group key (restaurant, agency, admin…)
//! - `restaurant_id` / `customer_id` / `agency_id` / `admin_id`: audience-specific ids
//! - `timestamp`: When the business fact happened
//! - `data`: Free-form event-specific map

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broker body for one notification-worthy business fact
///
/// # Examples
///
/// ```rust
/// use event_bus::NotificationEventPayload;
/// use serde_json::json;
///
/// let payload = NotificationEventPayload::new(
///     "evt_123".to_string(),
///     "RESERVATION_NEW".to_string(),
///     "RESTAURANT_TEAM".to_string(),
/// )
/// .with_recipient_id(Some(3))
/// .with_restaurant_id(Some(3))
/// .with_data(json!({ "reservationId": 147, "partySize": 4 }).as_object().cloned().unwrap());
///
/// assert_eq!(payload.restaurant_id, Some(3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEventPayload {
    pub event_id: String,

    pub event_type: String,

    pub recipient_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restaurant_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<i64>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NotificationEventPayload {
    /// Create a payload stamped with the current time and no optional ids
    pub fn new(event_id: String, event_type: String, recipient_type: String) -> Self {
        Self {
            event_id,
            event_type,
            recipient_type,
            recipient_id: None,
            restaurant_id: None,
            customer_id: None,
            agency_id: None,
            admin_id: None,
            timestamp: Utc::now(),
            data: Map::new(),
        }
    }

    pub fn with_recipient_id(mut self, id: Option<i64>) -> Self {
        self.recipient_id = id;
        self
    }

    pub fn with_restaurant_id(mut self, id: Option<i64>) -> Self {
        self.restaurant_id = id;
        self
    }

    pub fn with_customer_id(mut self, id: Option<i64>) -> Self {
        self.customer_id = id;
        self
    }

    pub fn with_agency_id(mut self, id: Option<i64>) -> Self {
        self.agency_id = id;
        self
    }

    pub fn with_admin_id(mut self, id: Option<i64>) -> Self {
        self.admin_id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Integer field from `data`, accepting numbers and numeric strings
    pub fn data_i64(&self, key: &str) -> Option<i64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Field from `data` rendered as display text
    pub fn data_text(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Validate a raw payload before typed deserialization
///
/// # Validation Rules
///
/// - `event_id`, `event_type`, `recipient_type`: present, string, non-empty
/// - `timestamp`: present
/// - `data`: object when present
pub fn validate_payload_fields(payload: &Value) -> Result<(), String> {
    for field in ["event_id", "event_type", "recipient_type"] {
        let value = payload
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {}", field))?;

        if value.trim().is_empty() {
            return Err(format!("{} cannot be empty", field));
        }
    }

    payload
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;

    if let Some(data) = payload.get("data") {
        if !data.is_object() && !data.is_null() {
            return Err("data must be an object".to_string());
        }
    }

    Ok(())
}
