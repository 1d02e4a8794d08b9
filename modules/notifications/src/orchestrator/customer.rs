use event_bus::NotificationEventPayload;

use super::{base_metadata, detail, humanize, ChannelRules, Orchestrator, OrchestratorError, Rendered};
use crate::models::{channel_set, Audience, Channel, ChannelSet, Priority};
use crate::store::{Recipient, RecipientGroup};

/// One customer per event
pub struct CustomerOrchestrator;

impl Orchestrator for CustomerOrchestrator {
    fn audience(&self) -> Audience {
        Audience::Customer
    }

    fn recipient_group(
        &self,
        payload: &NotificationEventPayload,
    ) -> Result<RecipientGroup, OrchestratorError> {
        payload
            .customer_id
            .or(payload.recipient_id)
            .map(RecipientGroup::Customer)
            .ok_or_else(|| OrchestratorError::MissingGroupKey {
                audience: Audience::Customer,
                event_id: payload.event_id.clone(),
            })
    }

    fn rules(&self, event_type: &str) -> ChannelRules {
        use Channel::*;

        match event_type {
            "RESERVATION_CONFIRMED" => ChannelRules::new(&[Email], &[Push, WebSocket]),
            "ORDER_READY" => ChannelRules::new(&[Push], &[Email, WebSocket]),
            "ORDER_STATUS_UPDATE" => ChannelRules::new(&[WebSocket], &[Push, Email]),
            "RESERVATION_REMINDER" => ChannelRules::new(&[], &[Email, Push, WebSocket]),
            _ => ChannelRules::new(&[WebSocket], &[Email, Push]),
        }
    }

    fn group_defaults(&self) -> ChannelSet {
        channel_set(&[Channel::Email, Channel::Push, Channel::WebSocket])
    }

    fn render(
        &self,
        payload: &NotificationEventPayload,
        recipient: &Recipient,
        channel: Channel,
    ) -> Rendered {
        let date = detail(payload, "date", "the booked date");
        let order = payload
            .data_text("orderId")
            .map(|id| format!("Order {}", id))
            .unwrap_or_else(|| "Your order".to_string());

        let (title, body) = match payload.event_type.as_str() {
            "RESERVATION_CONFIRMED" => (
                "Reservation confirmed".to_string(),
                format!(
                    "Your reservation for {} on {} is confirmed",
                    detail(payload, "pax", "your party"),
                    date
                ),
            ),
            "RESERVATION_REMINDER" => (
                "Reservation reminder".to_string(),
                format!("Reminder: you have a reservation on {}", date),
            ),
            "ORDER_READY" => (
                "Your order is ready".to_string(),
                format!("{} is ready for pickup", order),
            ),
            "ORDER_STATUS_UPDATE" => (
                "Order update".to_string(),
                format!("{} is now {}", order, detail(payload, "status", "updated")),
            ),
            other => (humanize(other), detail(payload, "message", "")),
        };

        let priority = match payload.event_type.as_str() {
            "RESERVATION_CONFIRMED" | "ORDER_READY" => Priority::High,
            _ => Priority::Normal,
        };

        Rendered {
            title: payload.data_text("title").unwrap_or(title),
            body: payload.data_text("body").unwrap_or(body),
            metadata: base_metadata(
                payload,
                channel,
                priority,
                Some(format!("/topic/customer/{}/notifications", recipient.id)),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_from_customer_or_recipient_id() {
        let payload = NotificationEventPayload::new("e".into(), "ORDER_READY".into(), "CUSTOMER".into());
        assert!(CustomerOrchestrator.recipient_group(&payload).is_err());

        let payload = payload.with_recipient_id(Some(9));
        assert_eq!(
            CustomerOrchestrator.recipient_group(&payload).unwrap(),
            RecipientGroup::Customer(9)
        );
    }

    #[test]
    fn test_render_order_ready() {
        let payload = NotificationEventPayload::new("e".into(), "ORDER_READY".into(), "CUSTOMER".into())
            .with_data(json!({ "orderId": 31 }).as_object().cloned().unwrap());
        let recipient = Recipient::new(9, channel_set(&[Channel::Push]));

        let rendered = CustomerOrchestrator.render(&payload, &recipient, Channel::WebSocket);
        assert_eq!(rendered.title, "Your order is ready");
        assert_eq!(rendered.body, "Order 31 is ready for pickup");
        assert_eq!(rendered.metadata["priority"], "HIGH");
        assert_eq!(rendered.metadata["orderId"], "31");
        assert_eq!(rendered.metadata["destination"], "/topic/customer/9/notifications");
    }

    #[test]
    fn test_explicit_title_wins() {
        let payload =
            NotificationEventPayload::new("e".into(), "PROMO_SENT".into(), "CUSTOMER".into())
                .with_data(json!({ "title": "Spring menu", "body": "Try it" }).as_object().cloned().unwrap());
        let rendered =
            CustomerOrchestrator.render(&payload, &Recipient::new(1, ChannelSet::new()), Channel::Email);

        assert_eq!(rendered.title, "Spring menu");
        assert_eq!(rendered.body, "Try it");
        assert!(!rendered.metadata.contains_key("destination"));
    }
}
