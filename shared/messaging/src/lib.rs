//! Chat message models shared by the DeskChat runtime and its clients.

pub mod delivery;
pub mod events;
pub mod moderation;
pub mod timestamp;
pub mod validation;

pub use delivery::{DeliveryEvent, DeliveryState, MessageStatus};
pub use events::ChannelEvent;
pub use timestamp::now_ms;
pub use validation::{
    BasicHtmlSanitizer, HtmlSanitizer, MessageValidationService, ValidationCode, ValidationIssue,
    ValidationOptions, ValidationResult,
};

use deskchat_crypto_core::{EncryptedContent, KeyId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};
use uuid::Uuid;

/// Metadata key set on messages re-published from the offline queue.
pub const OFFLINE_METADATA_KEY: &str = "offline";

/// Opaque key-value bag travelling with a message.
pub type Metadata = serde_json::Map<String, Value>;

/// Identifier of a conversation; also the name of its realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Client-generated message identifier, stable for the message's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Sender {
    User {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Agent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl Sender {
    pub fn user(id: Option<String>, name: Option<String>) -> Self {
        Self::User { id, name }
    }

    pub fn agent(id: Option<String>, name: Option<String>) -> Self {
        Self::Agent { id, name }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::User { id, .. } | Self::Agent { id, .. } => id.as_deref(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::User { name, .. } | Self::Agent { name, .. } => name.as_deref(),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Self::Agent { .. })
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::User {
            id: None,
            name: None,
        }
    }
}

/// A chat message as displayed, persisted and transmitted.
///
/// Delivery status is tracked beside the message, see [`DeliveryState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<KeyId>,
    #[serde(default)]
    pub sender: Sender,
    #[serde(with = "timestamp")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(conversation_id: ConversationId, sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_id,
            content: content.into(),
            encrypted_content: None,
            key_id: None,
            sender,
            timestamp: now_ms(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted_content.is_some() && self.key_id.is_some()
    }

    /// Whether the message was re-published from an offline queue.
    pub fn is_offline_origin(&self) -> bool {
        self.metadata
            .get(OFFLINE_METADATA_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn mark_offline_origin(&mut self) {
        self.metadata
            .insert(OFFLINE_METADATA_KEY.to_owned(), Value::Bool(true));
    }

    /// Attaches the encrypted payload, keeping the plaintext for local display.
    pub fn with_encryption(mut self, encrypted: EncryptedContent) -> Self {
        self.encrypted_content = Some(encrypted.encrypted_content);
        self.key_id = Some(encrypted.key_id);
        self
    }

    /// Copy suitable for the wire or for sealed storage: the plaintext is
    /// dropped and the encrypted payload attached.
    pub fn sealed(&self, encrypted: EncryptedContent) -> Self {
        Self {
            content: String::new(),
            ..self.clone().with_encryption(encrypted)
        }
    }

    /// Copy with the plaintext removed when an encrypted payload is present.
    pub fn without_plaintext(&self) -> Self {
        if self.is_encrypted() {
            Self {
                content: String::new(),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}

/// A logical thread between a customer and an agent or bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub last_message_timestamp: Option<i64>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: ConversationId, title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            kind: kind.into(),
            last_message: None,
            last_message_timestamp: None,
            unread_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Sending,
    Sent,
    Failed,
}

/// A message accepted locally but not yet handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: MessageId,
    /// Content as it will be transmitted: the sealed payload when the
    /// message is encrypted, the plaintext otherwise.
    pub content: String,
    pub channel_id: String,
    #[serde(with = "timestamp")]
    pub timestamp: i64,
    pub status: QueueStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub message: Message,
}

impl QueuedMessage {
    pub fn new(message: Message, channel_id: impl Into<String>) -> Self {
        let content = message
            .encrypted_content
            .clone()
            .unwrap_or_else(|| message.content.clone());
        Self {
            id: message.id.clone(),
            content,
            channel_id: channel_id.into(),
            timestamp: now_ms(),
            status: QueueStatus::Queued,
            retry_count: 0,
            message,
        }
    }
}

/// A remote participant currently composing a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(with = "timestamp")]
    pub timestamp: i64,
}

/// Messaging-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_wire_shape_is_camel_case() {
        let message = Message::new(
            ConversationId::new("conv-1"),
            Sender::agent(Some("a-1".into()), Some("Dana".into())),
            "Hi there",
        );
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["conversationId"], "conv-1");
        assert_eq!(value["sender"]["type"], "agent");
        assert_eq!(value["sender"]["name"], "Dana");
        assert!(value["timestamp"].is_i64());
        assert!(value.get("encryptedContent").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn message_accepts_iso_timestamps() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "conversationId": "conv-1",
            "content": "hello",
            "sender": { "type": "user" },
            "timestamp": "2024-01-01T12:00:00Z",
        }))
        .unwrap();

        assert_eq!(message.timestamp, 1_704_110_400_000);
        assert_eq!(message.sender, Sender::default());
    }

    #[test]
    fn offline_marker_roundtrips_through_metadata() {
        let mut message = Message::new(ConversationId::new("c"), Sender::default(), "x");
        assert!(!message.is_offline_origin());

        message.mark_offline_origin();
        let decoded: Message =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert!(decoded.is_offline_origin());
    }

    #[test]
    fn sealed_copy_drops_plaintext() {
        let message = Message::new(ConversationId::new("c"), Sender::default(), "secret");
        let sealed = message.sealed(EncryptedContent {
            encrypted_content: "Zm9v".into(),
            key_id: KeyId::from("c:v1:k"),
        });

        assert_eq!(sealed.id, message.id);
        assert!(sealed.content.is_empty());
        assert!(sealed.is_encrypted());
        assert_eq!(sealed.without_plaintext(), sealed);
    }

    #[test]
    fn queued_message_carries_transmitted_content() {
        let plain = Message::new(ConversationId::new("c"), Sender::default(), "hello");
        let queued = QueuedMessage::new(plain.clone(), "c");
        assert_eq!(queued.content, "hello");
        assert_eq!(queued.status, QueueStatus::Queued);
        assert_eq!(queued.retry_count, 0);

        let sealed = plain.sealed(EncryptedContent {
            encrypted_content: "c2VhbGVk".into(),
            key_id: KeyId::from("c:v1:k"),
        });
        assert_eq!(QueuedMessage::new(sealed, "c").content, "c2VhbGVk");
    }

    #[test]
    fn conversation_uses_type_field() {
        let conversation = Conversation::new(ConversationId::new("c"), "Billing", "support");
        let value = serde_json::to_value(&conversation).unwrap();
        assert_eq!(value["type"], "support");
        assert_eq!(value["unreadCount"], 0);
    }
}
