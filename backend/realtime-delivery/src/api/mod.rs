//! REST collaborator for history, fallback sends, voice URLs and
//! conversation management.

pub mod http;
pub mod resilient;

use crate::error::{DeliveryError, DeliveryResult, ErrorCode};
use crate::models::Message;
use crate::websocket::frames::ReceiptStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpMessagingApi;
pub use resilient::ResilientMessagingApi;

/// `{success: true, data} | {success: false, error: {code, message}}`
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    pub code: ErrorCode,
    #[serde(default)]
    pub message: String,
}

impl<T> ApiEnvelope<T> {
    /// The payload of a successful response
    pub fn into_data(self) -> DeliveryResult<T> {
        if !self.success {
            return Err(self.into_error());
        }
        self.data
            .ok_or_else(|| DeliveryError::Unknown("response carried no data".to_string()))
    }

    /// For endpoints whose success carries nothing worth reading
    pub fn into_ack(self) -> DeliveryResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }

    fn into_error(self) -> DeliveryError {
        match self.error {
            Some(body) => DeliveryError::from_envelope(body.code, body.message),
            None => DeliveryError::Unknown("request failed without an error body".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub last_message: Option<Message>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUploadUrl {
    pub upload_url: String,
    pub storage_id: String,
    /// Epoch millis
    pub expires_at: i64,
}

/// Page selector for `get_messages`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    pub limit: u32,
    /// Only messages created before this epoch-millis timestamp
    pub before: Option<i64>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            before: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn get_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> DeliveryResult<Vec<Message>>;

    /// Persist a message; the server's copy is returned
    async fn send_message(&self, message: &Message) -> DeliveryResult<Message>;

    async fn mark_conversation_as_read(&self, conversation_id: &str) -> DeliveryResult<()>;

    async fn generate_voice_upload_url(
        &self,
        conversation_id: &str,
        mime_type: &str,
        file_size: u64,
    ) -> DeliveryResult<VoiceUploadUrl>;

    async fn get_voice_message_url(&self, storage_id: &str) -> DeliveryResult<String>;

    async fn send_typing_indicator(
        &self,
        conversation_id: &str,
        is_typing: bool,
    ) -> DeliveryResult<()>;

    async fn send_delivery_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: ReceiptStatus,
    ) -> DeliveryResult<()>;

    async fn get_conversations(&self) -> DeliveryResult<Vec<Conversation>>;

    async fn create_conversation(&self, participant_id: &str) -> DeliveryResult<Conversation>;

    async fn delete_conversation(&self, conversation_id: &str) -> DeliveryResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_success() {
        let envelope: ApiEnvelope<VoiceUploadUrl> = serde_json::from_value(json!({
            "success": true,
            "data": {"uploadUrl": "https://s3/put", "storageId": "v1", "expiresAt": 10}
        }))
        .unwrap();
        assert_eq!(envelope.into_data().unwrap().storage_id, "v1");
    }

    #[test]
    fn test_envelope_error_maps_code() {
        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_value(json!({
            "success": false,
            "error": {"code": "USER_BLOCKED", "message": "blocked"}
        }))
        .unwrap();
        assert_eq!(envelope.into_ack(), Err(DeliveryError::UserBlocked));

        let envelope: ApiEnvelope<serde_json::Value> = serde_json::from_value(json!({
            "success": false,
            "error": {"code": "SERVER_ERROR", "message": "db down"}
        }))
        .unwrap();
        let err = envelope.into_data().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerError);
    }

    #[test]
    fn test_envelope_without_data() {
        let envelope: ApiEnvelope<Conversation> =
            serde_json::from_value(json!({"success": true})).unwrap();
        assert!(matches!(envelope.into_data(), Err(DeliveryError::Unknown(_))));
    }
}
