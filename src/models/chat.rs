//! Chat models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A direct or group conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// UUID v4
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Membership of a user in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub conversation_id: String,
    pub user_id: i64,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub sender_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// `{id, username}` as embedded in chat payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserShort {
    pub id: i64,
    pub username: String,
}

/// Message with its sender, as sent to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub sender: UserShort,
}

impl MessageView {
    pub fn new(message: Message, sender: UserShort) -> Self {
        Self {
            id: message.id,
            text: message.text,
            created_at: message.created_at,
            edited_at: message.edited_at,
            sender,
        }
    }
}

/// Conversation list entry
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<UserShort>,
    pub last_message: Option<MessageView>,
}

/// Conversation with its participants, returned when a chat is opened
#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    pub id: String,
    pub title: String,
    pub participants: Vec<UserShort>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One page of message history, oldest first
#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub results: Vec<MessageView>,
    pub page: i64,
    pub pages: i64,
    pub count: i64,
}

/// Number of pages for `count` rows; an empty history still has one page
pub fn page_count(count: i64, page_size: i64) -> i64 {
    if count <= 0 || page_size <= 0 {
        1
    } else {
        (count + page_size - 1) / page_size
    }
}

/// Frames a WebSocket client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage {
        #[serde(default)]
        text: String,
    },
    Typing {
        #[serde(default)]
        value: bool,
    },
}

/// Frames broadcast to every subscriber of a conversation
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Message(MessageView),
    Typing { user_id: i64, value: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0, 30), 1);
        assert_eq!(page_count(30, 30), 1);
        assert_eq!(page_count(31, 30), 2);
    }

    #[test]
    fn test_client_frames_parse() {
        let send: ClientFrame =
            serde_json::from_str(r#"{"action":"send_message","text":" hi "}"#).unwrap();
        assert_eq!(send, ClientFrame::SendMessage { text: " hi ".into() });

        let typing: ClientFrame = serde_json::from_str(r#"{"action":"typing","value":true}"#).unwrap();
        assert_eq!(typing, ClientFrame::Typing { value: true });

        assert!(serde_json::from_str::<ClientFrame>(r#"{"action":"dance"}"#).is_err());
    }

    #[test]
    fn test_server_event_shape() {
        let event = ServerEvent::Typing { user_id: 3, value: true };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "typing", "payload": {"user_id": 3, "value": true}})
        );

        let message = ServerEvent::Message(MessageView {
            id: 1,
            text: "hi".into(),
            created_at: Utc::now(),
            edited_at: None,
            sender: UserShort { id: 2, username: "bob".into() },
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["payload"]["sender"]["username"], "bob");
    }
}
