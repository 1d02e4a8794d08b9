use event_bus::NotificationEventPayload;

use super::{
    base_metadata, detail, ChannelRules, GroupKeys, Orchestrator, OrchestratorError, Rendered,
};
use crate::models::{channel_set, Audience, Channel, ChannelSet, Priority};
use crate::store::{Recipient, RecipientGroup};

/// Fans a restaurant event out to every enabled staff member
pub struct RestaurantOrchestrator;

impl RestaurantOrchestrator {
    fn restaurant_id(payload: &NotificationEventPayload) -> Option<i64> {
        payload.restaurant_id.or(payload.recipient_id)
    }

    /// Addressed to one staff member rather than the team
    fn is_personal(event_type: &str) -> bool {
        matches!(event_type, "TASK_ASSIGNMENT" | "DIRECT_MESSAGE")
    }

    fn priority(event_type: &str) -> Priority {
        match event_type {
            "KITCHEN_ALERT" | "CRITICAL_RESERVATION" | "NEW_ORDER" => Priority::High,
            t if t.starts_with("RESERVATION_") => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl Orchestrator for RestaurantOrchestrator {
    fn audience(&self) -> Audience {
        Audience::Restaurant
    }

    fn recipient_group(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<RecipientGroup, OrchestratorError> {
        Self::restaurant_id(payload)
            .map(RecipientGroup::RestaurantStaff)
            .ok_or_else(|| OrchestratorError::MissingGroupKey {
                audience: Audience::Restaurant,
                event_id: payload.event_id.clone(),
            })
    }

    fn rules(&self, event_type: &str) -> ChannelRules {
        use Channel::*;

        match event_type {
            "KITCHEN_ALERT" => ChannelRules::new(&[WebSocket, Push], &[Sms, Email]).critical(),
            // Personal messages never go to PUSH
            "TASK_ASSIGNMENT" | "DIRECT_MESSAGE" => ChannelRules::new(&[], &[Email, Sms, WebSocket]),
            _ => ChannelRules::new(&[WebSocket], &[Email, Push, Sms]),
        }
    }

    fn group_defaults(&self) -> ChannelSet {
        channel_set(&[Channel::WebSocket, Channel::Email, Channel::Push, Channel::Sms])
    }

    fn render(
        &self,
        payload: &NotificationEventPayload,
        _recipient: &Recipient,
        channel: Channel,
    ) -> Rendered {
        let guest = payload
            .data_text("customerName")
            .or_else(|| payload.data_text("email"))
            .unwrap_or_else(|| "Guest".to_string());
        let pax = payload
            .data_i64("pax")
            .or_else(|| payload.data_i64("partySize"))
            .unwrap_or(1);
        let date = detail(payload, "date", "an unspecified date");

        let (title, body) = match payload.event_type.as_str() {
            "RESERVATION_NEW" | "RESERVATION_REQUESTED" => (
                "New reservation",
                format!("New reservation from {} for {} people on {}", guest, pax, date),
            ),
            "RESERVATION_CANCEL" | "RESERVATION_CANCELLED" => (
                "Reservation cancelled",
                format!("Reservation of {} for {} people was cancelled", guest, pax),
            ),
            "RESERVATION_MODIFY" | "RESERVATION_MODIFIED" => (
                "Reservation modified",
                format!("Reservation of {} changed to {} people on {}", guest, pax, date),
            ),
            "RESERVATION_CONFIRMED" => (
                "Reservation confirmed",
                format!("Reservation of {} for {} people confirmed", guest, pax),
            ),
            "RESERVATION_REJECTED" => (
                "Reservation rejected",
                format!("Reservation of {} was rejected", guest),
            ),
            "RESERVATION_STATUS_CHANGED" => (
                "Reservation updated",
                format!(
                    "Reservation of {} is now {}",
                    guest,
                    detail(payload, "status", "updated")
                ),
            ),
            "KITCHEN_ALERT" => (
                "Kitchen alert",
                detail(payload, "message", "The kitchen needs attention"),
            ),
            "TASK_ASSIGNMENT" => (
                "New task",
                format!("You were assigned: {}", detail(payload, "task", "a new task")),
            ),
            "DIRECT_MESSAGE" => (
                "New message",
                detail(payload, "message", "You have a new message"),
            ),
            _ => ("Restaurant notification", "New restaurant notification".to_string()),
        };

        let destination = Self::restaurant_id(payload)
            .map(|id| format!("/topic/restaurant/{}/reservations", id));

        Rendered {
            title: payload.data_text("title").unwrap_or_else(|| title.to_string()),
            body: payload.data_text("body").unwrap_or(body),
            metadata: base_metadata(
                payload,
                channel,
                Self::priority(&payload.event_type),
                destination,
            ),
        }
    }

    fn group_keys(&self, payload: &NotificationEventPayload, recipient: &Recipient) -> GroupKeys {
        GroupKeys {
            restaurant_id: Self::restaurant_id(payload),
            hub_id: recipient.hub_id,
            agency_id: None,
            shared_read: !Self::is_personal(&payload.event_type),
        }
    }
}
