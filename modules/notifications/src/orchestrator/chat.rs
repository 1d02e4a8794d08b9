//! Chat events
//!
//! Chat traffic reaches every audience, so its rules and rendering are an
//! overlay consulted before the audience's own tables.

use event_bus::NotificationEventPayload;

use super::{base_metadata, detail, ChannelRules, Rendered};
use crate::models::{Channel, Priority};

const PREVIEW_CHARS: usize = 150;

pub(crate) fn is_chat_event(event_type: &str) -> bool {
    event_type.starts_with("CHAT_")
}

pub(crate) fn rules(event_type: &str) -> Option<ChannelRules> {
    if !is_chat_event(event_type) {
        return None;
    }

    let rules = match event_type {
        "CHAT_TYPING_INDICATOR" | "CHAT_MESSAGES_READ" | "CHAT_USER_JOINED" | "CHAT_USER_LEFT" => {
            ChannelRules::new(&[Channel::WebSocket], &[]).forbid(&[
                Channel::Sms,
                Channel::Email,
                Channel::Push,
            ])
        }
        _ => ChannelRules::new(&[Channel::WebSocket], &[Channel::Push]).forbid(&[Channel::Sms]),
    };
    Some(rules)
}

pub(crate) fn render(payload: &NotificationEventPayload, channel: Channel) -> Option<Rendered> {
    if !is_chat_event(&payload.event_type) {
        return None;
    }

    let sender = detail(payload, "senderName", "Someone");
    let title = match payload.event_type.as_str() {
        "CHAT_MESSAGE_RECEIVED" | "CHAT_GROUP_MESSAGE" | "CHAT_RESERVATION_MESSAGE" => {
            format!("New message from {}", sender)
        }
        "CHAT_TYPING_INDICATOR" => format!("{} is typing...", sender),
        "CHAT_USER_JOINED" => format!("{} joined the conversation", sender),
        "CHAT_USER_LEFT" => format!("{} left the conversation", sender),
        "CHAT_MESSAGES_READ" => "Messages read".to_string(),
        _ => "Chat update".to_string(),
    };

    let body = payload
        .data_text("content")
        .map(|content| preview(&content))
        .unwrap_or_default();

    let mut metadata = base_metadata(payload, channel, Priority::Normal, Some(destination(payload)));
    if let Some(conversation_id) = payload.data_text("conversationId") {
        metadata.insert("conversationId".to_string(), conversation_id);
    }

    Some(Rendered {
        title,
        body,
        metadata,
    })
}

fn destination(payload: &NotificationEventPayload) -> String {
    let Some(conversation_id) = payload.data_i64("conversationId") else {
        return "/topic/chat/unknown".to_string();
    };

    match payload.event_type.as_str() {
        "CHAT_MESSAGE_RECEIVED" => format!("/topic/chat/direct/{}", conversation_id),
        "CHAT_GROUP_MESSAGE" => format!("/topic/chat/group/{}", conversation_id),
        "CHAT_RESERVATION_MESSAGE" => format!(
            "/topic/chat/reservation/{}",
            payload.data_i64("reservationId").unwrap_or(conversation_id)
        ),
        "CHAT_TYPING_INDICATOR" | "CHAT_MESSAGES_READ" | "CHAT_USER_JOINED" | "CHAT_USER_LEFT" => {
            format!("/topic/chat/presence/{}", conversation_id)
        }
        _ => format!("/topic/chat/{}", conversation_id),
    }
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let mut cut: String = content.chars().take(PREVIEW_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel_set;
    use serde_json::json;

    fn chat(event_type: &str, data: serde_json::Value) -> NotificationEventPayload {
        NotificationEventPayload::new("evt".into(), event_type.into(), "CUSTOMER".into())
            .with_data(data.as_object().cloned().unwrap())
    }

    #[test]
    fn test_read_receipts_never_leave_websocket() {
        let receipts = rules("CHAT_MESSAGES_READ").unwrap();
        assert_eq!(receipts.allowed(), channel_set(&[Channel::WebSocket]));
    }

    #[test]
    fn test_messages_allow_push_but_not_sms() {
        let messages = rules("CHAT_MESSAGE_RECEIVED").unwrap();
        assert_eq!(messages.allowed(), channel_set(&[Channel::WebSocket, Channel::Push]));
        assert!(rules("RESERVATION_NEW").is_none());
    }

    #[test]
    fn test_destination_and_preview() {
        let long = "x".repeat(400);
        let rendered = render(
            &chat(
                "CHAT_GROUP_MESSAGE",
                json!({ "conversationId": 8, "senderName": "Ada", "content": long }),
            ),
            Channel::WebSocket,
        )
        .unwrap();

        assert_eq!(rendered.title, "New message from Ada");
        assert_eq!(rendered.body.chars().count(), PREVIEW_CHARS);
        assert!(rendered.body.ends_with("..."));
        assert_eq!(rendered.metadata["destination"], "/topic/chat/group/8");
    }

    #[test]
    fn test_missing_conversation_id() {
        let rendered =
            render(&chat("CHAT_USER_LEFT", json!({})), Channel::WebSocket).unwrap();
        assert_eq!(rendered.title, "Someone left the conversation");
        assert_eq!(rendered.metadata["destination"], "/topic/chat/unknown");
    }
}
