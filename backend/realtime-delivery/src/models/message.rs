use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Voice,
    Image,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Voice => "voice",
            MessageType::Image => "image",
        }
    }
}

/// Delivery status of a single message, in lifecycle order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Position in the pending → sent → delivered → read progression.
    /// `Failed` sits outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            MessageStatus::Pending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is forward progress.
    ///
    /// Receipts may arrive out of order; a late `delivered` must not
    /// downgrade a message that is already `read`.
    pub fn advances_to(&self, next: MessageStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(current), Some(next)) => next > current,
            // A failed message may be retried, and anything may fail
            (None, _) | (_, None) => true,
        }
    }
}

/// Blob metadata for voice and image messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub storage_id: String,
    /// Length in seconds, voice only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    pub file_size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: String,
    /// Epoch milliseconds
    pub created_at: i64,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

/// In-place changes applied by `MessageCache::update_message`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, message: &mut Message) {
        if let Some(status) = self.status {
            message.status = status;
        }
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(attachment) = &self.attachment {
            message.attachment = Some(attachment.clone());
        }
    }
}

/// What a caller hands to `MessagingService::send_message`
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub conversation_id: String,
    pub to_user_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub attachment: Option<Attachment>,
}

impl MessageDraft {
    pub fn text(
        conversation_id: impl Into<String>,
        to_user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            to_user_id: to_user_id.into(),
            message_type: MessageType::Text,
            content: content.into(),
            attachment: None,
        }
    }

    /// Materialize a pending message with a fresh id
    pub fn into_message(self, from_user_id: impl Into<String>) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: self.conversation_id,
            from_user_id: from_user_id.into(),
            to_user_id: self.to_user_id,
            message_type: self.message_type,
            content: self.content,
            created_at: now_millis(),
            status: MessageStatus::Pending,
            attachment: self.attachment,
        }
    }
}

/// Borrowed view of an outbound message, as seen by the security validator
/// and the REST send body
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage<'a> {
    pub from_user_id: &'a str,
    pub to_user_id: &'a str,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<&'a Attachment>,
}

impl<'a> From<&'a Message> for OutboundMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            from_user_id: &message.from_user_id,
            to_user_id: &message.to_user_id,
            message_type: message.message_type,
            content: &message.content,
            attachment: message.attachment.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_progression() {
        assert!(MessageStatus::Pending.advances_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Read));
        assert!(!MessageStatus::Read.advances_to(MessageStatus::Delivered));
        assert!(!MessageStatus::Sent.advances_to(MessageStatus::Sent));
        assert!(MessageStatus::Failed.advances_to(MessageStatus::Pending));
        assert!(MessageStatus::Sent.advances_to(MessageStatus::Failed));
    }

    #[test]
    fn test_patch_applies_only_set_fields() {
        let mut message = MessageDraft::text("c1", "u2", "hi").into_message("u1");
        MessagePatch::status(MessageStatus::Sent).apply(&mut message);
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.content, "hi");

        MessagePatch {
            content: Some("edited".into()),
            ..Default::default()
        }
        .apply(&mut message);
        assert_eq!(message.content, "edited");
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[test]
    fn test_draft_gets_fresh_pending_identity() {
        let a = MessageDraft::text("c1", "u2", "x").into_message("u1");
        let b = MessageDraft::text("c1", "u2", "x").into_message("u1");
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, MessageStatus::Pending);
        assert_eq!(a.from_user_id, "u1");
    }

    #[test]
    fn test_message_json_shape() {
        let message = Message {
            id: "m1".into(),
            conversation_id: "c1".into(),
            from_user_id: "u1".into(),
            to_user_id: "u2".into(),
            message_type: MessageType::Voice,
            content: String::new(),
            created_at: 1_700_000_000_000,
            status: MessageStatus::Delivered,
            attachment: Some(Attachment {
                storage_id: "s1".into(),
                duration: Some(12),
                file_size: 2048,
                mime_type: "audio/m4a".into(),
            }),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "voice");
        assert_eq!(json["status"], "delivered");
        assert_eq!(json["attachment"]["storageId"], "s1");
        assert_eq!(json["createdAt"], 1_700_000_000_000i64);
    }
}
