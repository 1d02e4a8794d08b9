use event_bus::NotificationEventPayload;

use super::{base_metadata, detail, humanize, ChannelRules, Orchestrator, OrchestratorError, Rendered};
use crate::models::{Audience, Channel, ChannelSet, Priority};
use crate::store::{Recipient, RecipientGroup};

/// Platform administrators; an event without an admin id goes to all of them
pub struct AdminOrchestrator;

impl Orchestrator for AdminOrchestrator {
    fn audience(&self) -> Audience {
        Audience::Admin
    }

    fn recipient_group(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<RecipientGroup, OrchestratorError> {
        Ok(payload
            .admin_id
            .or(payload.recipient_id)
            .map_or(RecipientGroup::AllAdmins, RecipientGroup::Admin))
    }

    fn rules(&self, event_type: &str) -> ChannelRules {
        use Channel::*;

        match event_type {
            "SYSTEM_ALERT" | "SYSTEM_ERROR" | "CRITICAL_INCIDENT" => {
                ChannelRules::new(&[Email, Sms], &[Push, Slack, WebSocket]).critical()
            }
            "DATABASE_ALERT" | "SERVICE_DOWN" => ChannelRules::new(&[Email], &[Push, Sms, Slack]),
            "SECURITY_INCIDENT" => ChannelRules::new(&[Sms, Slack], &[Email, Push]).critical(),
            "RESOURCE_QUOTA" => ChannelRules::new(&[Email], &[Slack, Push, WebSocket]),
            "SUPPORT_TICKET_CREATED" | "SUPPORT_TICKET_REOPENED" => {
                ChannelRules::new(&[Email, WebSocket], &[Push, Slack])
            }
            "SUPPORT_TICKET_ESCALATED" => {
                ChannelRules::new(&[Email, Sms], &[Push, Slack, WebSocket]).critical()
            }
            "SUPPORT_TICKET_RESOLVED" => ChannelRules::new(&[Email], &[Push, WebSocket]),
            _ => ChannelRules::new(&[Email], &[Push, Slack, WebSocket]),
        }
    }

    fn group_defaults(&self) -> ChannelSet {
        Channel::ALL.iter().copied().collect()
    }

    fn render(
        &self,
        payload: &NotificationEventPayload,
        recipient: &Recipient,
        channel: Channel,
    ) -> Rendered {
        let ticket = detail(payload, "ticketId", "?");

        let title = match payload.event_type.as_str() {
            "SYSTEM_ALERT" => "System alert".to_string(),
            "SYSTEM_ERROR" => "System error".to_string(),
            "CRITICAL_INCIDENT" => "Critical incident".to_string(),
            "SECURITY_INCIDENT" => "Security incident".to_string(),
            "SERVICE_DOWN" => format!("Service down: {}", detail(payload, "service", "unknown")),
            "SUPPORT_TICKET_CREATED" => format!("New support ticket #{}", ticket),
            "SUPPORT_TICKET_ESCALATED" => format!("Support ticket #{} escalated", ticket),
            "SUPPORT_TICKET_RESOLVED" => format!("Support ticket #{} resolved", ticket),
            "SUPPORT_TICKET_REOPENED" => format!("Support ticket #{} reopened", ticket),
            other => humanize(other),
        };

        let body = payload
            .data_text("message")
            .or_else(|| payload.data_text("description"))
            .unwrap_or_default();

        let priority = match payload.event_type.as_str() {
            "SYSTEM_ALERT" | "SYSTEM_ERROR" | "CRITICAL_INCIDENT" | "SECURITY_INCIDENT"
            | "SERVICE_DOWN" | "SUPPORT_TICKET_ESCALATED" => Priority::High,
            "SUPPORT_TICKET_RESOLVED" => Priority::Low,
            _ => Priority::Normal,
        };

        Rendered {
            title: payload.data_text("title").unwrap_or(title),
            body: payload.data_text("body").unwrap_or(body),
            metadata: base_metadata(
                payload,
                channel,
                priority,
                Some(format!("/topic/admin/{}/notifications", recipient.id)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel_set;

    #[test]
    fn test_broadcast_without_admin_id() {
        let payload = NotificationEventPayload::new("e".into(), "SYSTEM_ALERT".into(), "ADMIN".into());
        assert_eq!(
            AdminOrchestrator.recipient_group(&payload).unwrap(),
            RecipientGroup::AllAdmins
        );
        assert_eq!(
            AdminOrchestrator
                .recipient_group(&payload.with_admin_id(Some(2)))
                .unwrap(),
            RecipientGroup::Admin(2)
        );
    }

    #[test]
    fn test_system_alert_forces_email_and_sms() {
        let rules = AdminOrchestrator.rules("SYSTEM_ALERT");
        let channels =
            rules.channels_for(&channel_set(&[Channel::Push]), &AdminOrchestrator.group_defaults());

        assert_eq!(channels, channel_set(&[Channel::Email, Channel::Sms, Channel::Push]));
    }

    #[test]
    fn test_routine_events_respect_opt_out() {
        let rules = AdminOrchestrator.rules("SUPPORT_TICKET_CREATED");
        assert!(!rules.critical);
        assert!(rules
            .channels_for(&ChannelSet::new(), &AdminOrchestrator.group_defaults())
            .is_empty());
    }
}
