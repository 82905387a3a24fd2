use crate::error::DeliveryError;
use crate::models::{Attachment, Message, MessageStatus, MessageType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every `type` value this client understands
pub const KNOWN_FRAME_TYPES: &[&str] = &[
    "message",
    "typing",
    "delivery_receipt",
    "read_receipt",
    "ping",
    "pong",
    "batch",
    "auth",
    "auth_refresh",
];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<FrameError> for DeliveryError {
    fn from(e: FrameError) -> Self {
        DeliveryError::MalformedFrame(e.to_string())
    }
}

/// Socket frames, both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Message(MessageFrame),
    Typing(TypingFrame),
    DeliveryReceipt(DeliveryReceiptFrame),
    ReadReceipt(ReadReceiptFrame),
    Ping,
    Pong,
    Batch(BatchFrame),
    Auth(AuthFrame),
    AuthRefresh(AuthFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFrame {
    pub id: String,
    pub conversation_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    #[serde(alias = "text")]
    pub content: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingFrame {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptStatus {
    Sent,
    Delivered,
    Read,
}

impl From<ReceiptStatus> for MessageStatus {
    fn from(status: ReceiptStatus) -> Self {
        match status {
            ReceiptStatus::Sent => MessageStatus::Sent,
            ReceiptStatus::Delivered => MessageStatus::Delivered,
            ReceiptStatus::Read => MessageStatus::Read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceiptFrame {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub status: ReceiptStatus,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptFrame {
    pub message_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFrame {
    pub messages: Vec<Frame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub token: String,
    pub user_id: String,
    pub ts: i64,
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Message(_) => "message",
            Frame::Typing(_) => "typing",
            Frame::DeliveryReceipt(_) => "delivery_receipt",
            Frame::ReadReceipt(_) => "read_receipt",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Batch(_) => "batch",
            Frame::Auth(_) => "auth",
            Frame::AuthRefresh(_) => "auth_refresh",
        }
    }

    /// Message frames go through send gating; everything else bypasses it
    pub fn is_message(&self) -> bool {
        matches!(self, Frame::Message(_))
    }

    /// Frames that may be coalesced into a `batch`
    pub fn is_batchable(&self) -> bool {
        matches!(
            self,
            Frame::Message(_) | Frame::Typing(_) | Frame::DeliveryReceipt(_) | Frame::ReadReceipt(_)
        )
    }

    pub fn to_json(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<&Message> for MessageFrame {
    fn from(message: &Message) -> Self {
        let attachment = message.attachment.as_ref();
        Self {
            id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            from_user_id: message.from_user_id.clone(),
            to_user_id: message.to_user_id.clone(),
            content: message.content.clone(),
            timestamp: message.created_at,
            message_type: Some(message.message_type),
            status: None,
            storage_id: attachment.map(|a| a.storage_id.clone()),
            duration: attachment.and_then(|a| a.duration),
            file_size: attachment.map(|a| a.file_size),
            mime_type: attachment.map(|a| a.mime_type.clone()),
        }
    }
}

impl MessageFrame {
    /// Inbound frame as a cache entry; missing status means the server
    /// has delivered it to us.
    pub fn into_message(self) -> Message {
        let attachment = self.storage_id.map(|storage_id| Attachment {
            storage_id,
            duration: self.duration,
            file_size: self.file_size.unwrap_or(0),
            mime_type: self.mime_type.unwrap_or_default(),
        });
        Message {
            id: self.id,
            conversation_id: self.conversation_id,
            from_user_id: self.from_user_id,
            to_user_id: self.to_user_id,
            message_type: self.message_type.unwrap_or_default(),
            content: self.content,
            created_at: self.timestamp,
            status: self.status.unwrap_or(MessageStatus::Delivered),
            attachment,
        }
    }
}

/// Result of classifying one inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Known(Frame),
    /// Well-formed JSON object whose `type` this client does not handle
    Unrecognized { kind: String },
}

pub fn parse_frame(text: &str) -> Result<ParsedFrame, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| FrameError::Malformed("missing string `type` field".to_string()))?;

    if !KNOWN_FRAME_TYPES.contains(&kind) {
        return Ok(ParsedFrame::Unrecognized {
            kind: kind.to_string(),
        });
    }

    serde_json::from_value::<Frame>(value)
        .map(ParsedFrame::Known)
        .map_err(|e| FrameError::Malformed(e.to_string()))
}
