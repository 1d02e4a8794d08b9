//! Recipient orchestrators
//!
//! One orchestrator per audience turns a broker payload into the concrete
//! (recipient, channel) notifications to persist. Every orchestrator supplies
//! the same four things: who the event is addressed to, the channel rules per
//! event type, the audience-wide channel defaults, and the rendered text.
//! The channel arithmetic itself is shared and lives in [`plan`].
//!
//! ```text
//! allowed  = (mandatory ∪ optional) \ forbidden
//! critical : mandatory ∪ (prefs ∩ group ∩ allowed)
//! otherwise:              prefs ∩ group ∩ allowed
//! ```

mod admin;
mod agency;
mod chat;
mod customer;
mod restaurant;

pub use admin::AdminOrchestrator;
pub use agency::AgencyOrchestrator;
pub use customer::CustomerOrchestrator;
pub use restaurant::RestaurantOrchestrator;

use event_bus::NotificationEventPayload;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::models::{channel_set, Audience, Channel, ChannelSet, NewNotification, Priority};
use crate::store::{Recipient, RecipientDirectory, RecipientGroup, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("event {event_id} carries no group key for the {audience} audience")]
    MissingGroupKey { audience: Audience, event_id: String },

    #[error("recipient directory lookup failed: {0}")]
    Directory(#[from] StoreError),
}

/// Channel rules for one event type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRules {
    pub mandatory: ChannelSet,
    pub optional: ChannelSet,
    pub forbidden: ChannelSet,
    /// Mandatory channels override user opt-outs
    pub critical: bool,
}

impl ChannelRules {
    pub fn new(mandatory: &[Channel], optional: &[Channel]) -> Self {
        Self {
            mandatory: channel_set(mandatory),
            optional: channel_set(optional),
            forbidden: ChannelSet::new(),
            critical: false,
        }
    }

    pub fn forbid(mut self, channels: &[Channel]) -> Self {
        self.forbidden.extend(channels.iter().copied());
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn allowed(&self) -> ChannelSet {
        self.mandatory
            .union(&self.optional)
            .filter(|c| !self.forbidden.contains(c))
            .copied()
            .collect()
    }

    /// Final channels for one recipient
    pub fn channels_for(&self, preferences: &ChannelSet, group_defaults: &ChannelSet) -> ChannelSet {
        let allowed = self.allowed();
        let mut channels: ChannelSet = preferences
            .iter()
            .filter(|c| group_defaults.contains(c) && allowed.contains(c))
            .copied()
            .collect();

        if self.critical {
            channels.extend(self.mandatory.iter().filter(|c| !self.forbidden.contains(c)));
        }
        channels
    }
}

/// Rendered content for one notification row
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

/// Group keys copied onto a notification row for shared reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupKeys {
    pub restaurant_id: Option<i64>,
    pub hub_id: Option<i64>,
    pub agency_id: Option<i64>,
    /// Readable by the whole group rather than only its recipient
    pub shared_read: bool,
}

/// One (recipient, channel) pair produced by disaggregation
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedNotification {
    pub recipient_id: i64,
    pub channel: Channel,
    pub rendered: Rendered,
    pub keys: GroupKeys,
}

impl PlannedNotification {
    pub fn into_new_notification(
        self,
        audience: Audience,
        payload: &NotificationEventPayload,
    ) -> NewNotification {
        NewNotification {
            audience,
            event_id: payload.event_id.clone(),
            event_type: payload.event_type.clone(),
            recipient_id: self.recipient_id,
            channel: self.channel,
            title: self.rendered.title,
            body: self.rendered.body,
            metadata: self.rendered.metadata,
            restaurant_id: self.keys.restaurant_id,
            hub_id: self.keys.hub_id,
            agency_id: self.keys.agency_id,
            shared_read: self.keys.shared_read,
        }
    }
}

pub trait Orchestrator: Send + Sync {
    fn audience(&self) -> Audience;

    /// Who the event is addressed to
    fn recipient_group(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<RecipientGroup, OrchestratorError>;

    fn rules(&self, event_type: &str) -> ChannelRules;

    /// Channels this audience delivers on at all
    fn group_defaults(&self) -> ChannelSet;

    fn render(
        &self,
        payload: &NotificationEventPayload,
        recipient: &Recipient,
        channel: Channel,
    ) -> Rendered;

    fn group_keys(&self, _payload: &NotificationEventPayload, _recipient: &Recipient) -> GroupKeys {
        GroupKeys::default()
    }
}

/// Event types that never produce notifications
#[derive(Debug, Clone, Default)]
pub struct BlockedEventTypes(HashSet<String>);

impl BlockedEventTypes {
    pub fn new(event_types: impl IntoIterator<Item = String>) -> Self {
        Self(
            event_types
                .into_iter()
                .map(|t| t.trim().to_ascii_uppercase())
                .collect(),
        )
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.0.contains(&event_type.trim().to_ascii_uppercase())
    }
}

/// Pure disaggregation over an already-loaded recipient list
pub fn plan(
    orchestrator: &dyn Orchestrator,
    payload: &NotificationEventPayload,
    recipients: &[Recipient],
    blocked: &BlockedEventTypes,
) -> Vec<PlannedNotification> {
    if blocked.contains(&payload.event_type) {
        tracing::info!(
            event_id = %payload.event_id,
            event_type = %payload.event_type,
            "Event type is blocked, nothing to notify"
        );
        return Vec::new();
    }

    let rules = chat::rules(&payload.event_type)
        .unwrap_or_else(|| orchestrator.rules(&payload.event_type));
    let group_defaults = orchestrator.group_defaults();

    let planned: Vec<PlannedNotification> = recipients
        .iter()
        .filter(|r| r.enabled)
        .flat_map(|recipient| {
            let keys = orchestrator.group_keys(payload, recipient);
            rules
                .channels_for(&recipient.channels, &group_defaults)
                .into_iter()
                .map(move |channel| PlannedNotification {
                    recipient_id: recipient.id,
                    channel,
                    rendered: chat::render(payload, channel)
                        .unwrap_or_else(|| orchestrator.render(payload, recipient, channel)),
                    keys,
                })
        })
        .collect();

    if recipients.iter().all(|r| !r.enabled) {
        tracing::info!(
            event_id = %payload.event_id,
            audience = %orchestrator.audience(),
            "No active recipients for event"
        );
    }

    planned
}

/// Load the recipient group and plan the notifications
///
/// A group that resolves to nobody is not an error: the result is empty.
pub async fn disaggregate(
    orchestrator: &dyn Orchestrator,
    directory: &dyn RecipientDirectory,
    payload: &NotificationEventPayload,
    blocked: &BlockedEventTypes,
) -> Result<Vec<PlannedNotification>, OrchestratorError> {
    if blocked.contains(&payload.event_type) {
        return Ok(plan(orchestrator, payload, &[], blocked));
    }

    let group = orchestrator.recipient_group(payload)?;
    let recipients = directory.resolve(&group).await?;

    tracing::debug!(
        event_id = %payload.event_id,
        group = ?group,
        recipients = recipients.len(),
        "Recipient group resolved"
    );

    Ok(plan(orchestrator, payload, &recipients, blocked))
}

/// Explicit audience → orchestrator mapping, built once at startup
#[derive(Clone, Default)]
pub struct OrchestratorRegistry {
    by_audience: HashMap<Audience, Arc<dyn Orchestrator>>,
}

impl OrchestratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in audiences
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CustomerOrchestrator));
        registry.register(Arc::new(RestaurantOrchestrator));
        registry.register(Arc::new(AdminOrchestrator));
        registry.register(Arc::new(AgencyOrchestrator));
        registry
    }

    pub fn register(&mut self, orchestrator: Arc<dyn Orchestrator>) {
        self.by_audience.insert(orchestrator.audience(), orchestrator);
    }

    pub fn get(&self, audience: Audience) -> Option<Arc<dyn Orchestrator>> {
        self.by_audience.get(&audience).cloned()
    }

    pub fn audiences(&self) -> Vec<Audience> {
        let mut audiences: Vec<Audience> = self.by_audience.keys().copied().collect();
        audiences.sort();
        audiences
    }
}

// ============================================================================
// SHARED RENDERING HELPERS
// ============================================================================

/// Metadata every rendered notification carries
pub(crate) fn base_metadata(
    payload: &NotificationEventPayload,
    channel: Channel,
    priority: Priority,
    destination: Option<String>,
) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert("event_type".to_string(), payload.event_type.clone());
    metadata.insert("priority".to_string(), priority.as_str().to_string());
    if channel == Channel::WebSocket {
        if let Some(destination) = destination {
            metadata.insert("destination".to_string(), destination);
        }
    }
    for key in ["reservationId", "orderId", "bookingId", "ticketId", "chatId"] {
        if let Some(value) = payload.data_text(key) {
            metadata.insert(key.to_string(), value);
        }
    }
    metadata
}

/// `data[key]` as text, or `fallback`
pub(crate) fn detail(payload: &NotificationEventPayload, key: &str, fallback: &str) -> String {
    payload
        .data_text(key)
        .unwrap_or_else(|| fallback.to_string())
}

/// Generic title for event types without a dedicated template
pub(crate) fn humanize(event_type: &str) -> String {
    let lower = event_type.trim().to_ascii_lowercase().replace('_', " ");
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
