use event_bus::NotificationEventPayload;

use super::{
    base_metadata, detail, humanize, ChannelRules, GroupKeys, Orchestrator, OrchestratorError,
    Rendered,
};
use crate::models::{channel_set, Audience, Channel, ChannelSet, Priority};
use crate::store::{Recipient, RecipientGroup};

/// Fans an agency event out to the agency's users
pub struct AgencyOrchestrator;

impl AgencyOrchestrator {
    fn agency_id(payload: &NotificationEventPayload) -> Option<i64> {
        payload.agency_id.or(payload.recipient_id)
    }
}

impl Orchestrator for AgencyOrchestrator {
    fn audience(&self) -> Audience {
        Audience::Agency
    }

    fn recipient_group(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<RecipientGroup, OrchestratorError> {
        Self::agency_id(payload)
            .map(RecipientGroup::AgencyUsers)
            .ok_or_else(|| OrchestratorError::MissingGroupKey {
                audience: Audience::Agency,
                event_id: payload.event_id.clone(),
            })
    }

    fn rules(&self, event_type: &str) -> ChannelRules {
        use Channel::*;

        match event_type {
            "URGENT_BOOKING" => ChannelRules::new(&[WebSocket, Push], &[Sms, Email]).critical(),
            "ASSIGNMENT_AVAILABLE" => ChannelRules::new(&[], &[Email, Sms, WebSocket]),
            _ => ChannelRules::new(&[WebSocket], &[Email, Push, Sms]),
        }
    }

    fn group_defaults(&self) -> ChannelSet {
        channel_set(&[Channel::Email, Channel::Push, Channel::Sms, Channel::WebSocket])
    }

    fn render(
        &self,
        payload: &NotificationEventPayload,
        _recipient: &Recipient,
        channel: Channel,
    ) -> Rendered {
        let booking = detail(payload, "bookingId", "?");

        let (title, body) = match payload.event_type.as_str() {
            "BOOKING_REQUEST" => (
                "Booking request".to_string(),
                format!("Booking #{} is waiting for confirmation", booking),
            ),
            "NEW_BOOKING" => (
                "New booking".to_string(),
                format!("Booking #{} was created", booking),
            ),
            "URGENT_BOOKING" => (
                "Urgent booking".to_string(),
                format!("Booking #{} needs immediate attention", booking),
            ),
            "ASSIGNMENT_AVAILABLE" => (
                "Assignment available".to_string(),
                detail(payload, "message", "A new assignment is available"),
            ),
            other => (humanize(other), detail(payload, "message", "")),
        };

        let priority = match payload.event_type.as_str() {
            "URGENT_BOOKING" | "CRITICAL_ASSIGNMENT" | "BOOKING_REQUEST" | "NEW_BOOKING" => {
                Priority::High
            }
            _ => Priority::Normal,
        };

        let destination =
            Self::agency_id(payload).map(|id| format!("/topic/agency/{}/notifications", id));

        Rendered {
            title: payload.data_text("title").unwrap_or(title),
            body: payload.data_text("body").unwrap_or(body),
            metadata: base_metadata(payload, channel, priority, destination),
        }
    }

    fn group_keys(&self, payload: &NotificationEventPayload, recipient: &Recipient) -> GroupKeys {
        GroupKeys {
            restaurant_id: None,
            hub_id: recipient.hub_id,
            agency_id: Self::agency_id(payload),
            shared_read: !matches!(
                payload.event_type.as_str(),
                "ASSIGNMENT_AVAILABLE" | "DIRECT_MESSAGE"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_agency_is_an_error() {
        let payload =
            NotificationEventPayload::new("e".into(), "NEW_BOOKING".into(), "AGENCY_USER".into());
        assert!(matches!(
            AgencyOrchestrator.recipient_group(&payload),
            Err(OrchestratorError::MissingGroupKey { audience: Audience::Agency, .. })
        ));
    }

    #[test]
    fn test_urgent_booking_forces_push() {
        let channels = AgencyOrchestrator
            .rules("URGENT_BOOKING")
            .channels_for(&channel_set(&[Channel::Email]), &AgencyOrchestrator.group_defaults());
        assert_eq!(
            channels,
            channel_set(&[Channel::Email, Channel::Push, Channel::WebSocket])
        );
    }

    #[test]
    fn test_render_and_keys() {
        let payload =
            NotificationEventPayload::new("e".into(), "URGENT_BOOKING".into(), "AGENCY".into())
                .with_agency_id(Some(6))
                .with_data(json!({ "bookingId": 77 }).as_object().cloned().unwrap());
        let recipient = Recipient::new(20, ChannelSet::new()).with_hub(2);

        let rendered = AgencyOrchestrator.render(&payload, &recipient, Channel::WebSocket);
        assert_eq!(rendered.body, "Booking #77 needs immediate attention");
        assert_eq!(rendered.metadata["destination"], "/topic/agency/6/notifications");

        let keys = AgencyOrchestrator.group_keys(&payload, &recipient);
        assert_eq!((keys.agency_id, keys.hub_id), (Some(6), Some(2)));
    }
}
