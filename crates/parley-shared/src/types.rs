use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MessageError;

// User identity = opaque id issued by the account service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(s: &str) -> Result<Self, MessageError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MessageError::EmptyUserId);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A direct message between two users.
///
/// Field names serialize in camelCase because browser clients read the
/// record as-is from both the HTTP API and the live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,
    /// URL of an image hosted elsewhere.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub image: Option<String>,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a fresh, unseen message. Blank text or image fields are
    /// dropped; at least one of them must remain.
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        text: Option<String>,
        image: Option<String>,
    ) -> Result<Self, MessageError> {
        let text = non_blank(text);
        let image = non_blank(image);
        if text.is_none() && image.is_none() {
            return Err(MessageError::EmptyMessage);
        }

        Ok(Self {
            id: MessageId::new(),
            sender_id,
            receiver_id,
            text,
            image,
            seen: false,
            created_at: Utc::now(),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn test_user_id_rejects_blank() {
        assert_eq!(UserId::parse("   "), Err(MessageError::EmptyUserId));
        assert_eq!(uid(" u1 ").as_str(), "u1");
    }

    #[test]
    fn test_new_message_is_unseen() {
        let msg = ChatMessage::new(uid("u1"), uid("u2"), Some("hi".into()), None).unwrap();
        assert!(!msg.seen);
        assert_eq!(msg.text.as_deref(), Some("hi"));
        assert!(msg.image.is_none());
    }

    #[test]
    fn test_new_message_requires_content() {
        let err = ChatMessage::new(uid("u1"), uid("u2"), Some("  ".into()), Some(String::new()))
            .unwrap_err();
        assert_eq!(err, MessageError::EmptyMessage);
    }

    #[test]
    fn test_message_json_uses_camel_case() {
        let msg = ChatMessage::new(uid("u1"), uid("u2"), None, Some("https://img/x.png".into()))
            .unwrap();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["_id"], msg.id.to_string());
        assert_eq!(json["senderId"], "u1");
        assert_eq!(json["receiverId"], "u2");
        assert_eq!(json["seen"], false);
        assert!(json.get("text").is_none());
        assert!(json.get("createdAt").is_some());
    }
}
