use crate::api::{ApiEnvelope, Conversation, MessageQuery, MessagingApi, VoiceUploadUrl};
use crate::auth::AuthProvider;
use crate::config::ApiConfig;
use crate::error::{DeliveryError, DeliveryResult, ErrorCode};
use crate::models::{Message, OutboundMessage};
use crate::websocket::frames::ReceiptStatus;
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    client_message_id: &'a str,
    conversation_id: &'a str,
    created_at: i64,
    #[serde(flatten)]
    message: OutboundMessage<'a>,
}

#[derive(Deserialize)]
struct VoiceUrlBody {
    url: String,
}

/// `MessagingApi` over the backend's JSON REST surface
pub struct HttpMessagingApi {
    client: Client,
    base_url: String,
    auth: Arc<dyn AuthProvider>,
}

impl HttpMessagingApi {
    pub fn new(config: &ApiConfig, auth: Arc<dyn AuthProvider>) -> DeliveryResult<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| DeliveryError::Config("REST base url is not configured".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DeliveryError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    /// Attach the bearer token, send, and unwrap the response envelope
    async fn execute<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> DeliveryResult<ApiEnvelope<T>> {
        let session = self
            .auth
            .current_session()
            .await
            .ok_or(DeliveryError::Unauthorized)?;

        let response = builder.bearer_auth(&session.token).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "rest response");

        match serde_json::from_str::<ApiEnvelope<T>>(&body) {
            Ok(envelope) if status.is_success() => Ok(envelope),
            // A bare failure without a specific code keeps its HTTP status for retry classification
            Ok(envelope)
                if envelope
                    .error
                    .as_ref()
                    .is_some_and(|e| e.code != ErrorCode::UnknownError) =>
            {
                Ok(envelope)
            }
            Ok(envelope) => Err(DeliveryError::Http {
                status: status.as_u16(),
                message: envelope
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| status.to_string()),
            }),
            Err(_) if !status.is_success() => Err(DeliveryError::Http {
                status: status.as_u16(),
                message: body,
            }),
            Err(e) => Err(DeliveryError::Unknown(format!("invalid response body: {e}"))),
        }
    }
}

#[async_trait]
impl MessagingApi for HttpMessagingApi {
    async fn get_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> DeliveryResult<Vec<Message>> {
        let mut builder = self
            .request(Method::GET, &format!("/conversations/{conversation_id}/messages"))
            .query(&[("limit", query.limit)]);
        if let Some(before) = query.before {
            builder = builder.query(&[("before", before)]);
        }
        self.execute(builder).await?.into_data()
    }

    async fn send_message(&self, message: &Message) -> DeliveryResult<Message> {
        let body = SendMessageBody {
            client_message_id: &message.id,
            conversation_id: &message.conversation_id,
            created_at: message.created_at,
            message: message.into(),
        };
        let builder = self.request(Method::POST, "/messages").json(&body);
        self.execute(builder).await?.into_data()
    }

    async fn mark_conversation_as_read(&self, conversation_id: &str) -> DeliveryResult<()> {
        let builder = self.request(Method::POST, &format!("/conversations/{conversation_id}/read"));
        self.execute::<serde_json::Value>(builder).await?.into_ack()
    }

    async fn generate_voice_upload_url(
        &self,
        conversation_id: &str,
        mime_type: &str,
        file_size: u64,
    ) -> DeliveryResult<VoiceUploadUrl> {
        let builder = self.request(Method::POST, "/voice/upload-url").json(&json!({
            "conversationId": conversation_id,
            "mimeType": mime_type,
            "fileSize": file_size,
        }));
        self.execute(builder).await?.into_data()
    }

    async fn get_voice_message_url(&self, storage_id: &str) -> DeliveryResult<String> {
        let builder = self.request(Method::GET, &format!("/voice/{storage_id}/url"));
        let body: VoiceUrlBody = self.execute(builder).await?.into_data()?;
        Ok(body.url)
    }

    async fn send_typing_indicator(
        &self,
        conversation_id: &str,
        is_typing: bool,
    ) -> DeliveryResult<()> {
        let builder = self
            .request(Method::POST, &format!("/conversations/{conversation_id}/typing"))
            .json(&json!({ "isTyping": is_typing }));
        self.execute::<serde_json::Value>(builder).await?.into_ack()
    }

    async fn send_delivery_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: ReceiptStatus,
    ) -> DeliveryResult<()> {
        let builder = self
            .request(Method::POST, &format!("/messages/{message_id}/receipts"))
            .json(&json!({ "conversationId": conversation_id, "status": status }));
        self.execute::<serde_json::Value>(builder).await?.into_ack()
    }

    async fn get_conversations(&self) -> DeliveryResult<Vec<Conversation>> {
        let builder = self.request(Method::GET, "/conversations");
        self.execute(builder).await?.into_data()
    }

    async fn create_conversation(&self, participant_id: &str) -> DeliveryResult<Conversation> {
        let builder = self
            .request(Method::POST, "/conversations")
            .json(&json!({ "participantId": participant_id }));
        self.execute(builder).await?.into_data()
    }

    async fn delete_conversation(&self, conversation_id: &str) -> DeliveryResult<()> {
        let builder = self.request(Method::DELETE, &format!("/conversations/{conversation_id}"));
        self.execute::<serde_json::Value>(builder).await?.into_ack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::models::{MessageDraft, MessageStatus};
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer, auth: StaticAuth) -> HttpMessagingApi {
        let config = ApiConfig {
            base_url: Some(format!("{}/", server.uri())),
            request_timeout: Duration::from_secs(5),
        };
        HttpMessagingApi::new(&config, Arc::new(auth)).unwrap()
    }

    #[test]
    fn test_requires_base_url() {
        let result = HttpMessagingApi::new(&ApiConfig::default(), Arc::new(StaticAuth::signed_out()));
        assert!(matches!(result, Err(DeliveryError::Config(_))));
    }

    #[tokio::test]
    async fn test_get_messages_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/conversations/c1/messages"))
            .and(query_param("limit", "20"))
            .and(query_param("before", "99"))
            .and(header("authorization", "Bearer t0k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [{
                    "id": "m1", "conversationId": "c1", "fromUserId": "u2", "toUserId": "u1",
                    "type": "text", "content": "hi", "createdAt": 5, "status": "delivered"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let messages = api(&server, StaticAuth::new("u1", "t0k"))
            .get_messages("c1", MessageQuery { limit: 20, before: Some(99) })
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
    }

    #[tokio::test]
    async fn test_send_message_body() {
        let server = MockServer::start().await;
        let message = MessageDraft::text("c1", "u2", "Hello world!").into_message("u1");
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(body_partial_json(json!({
                "clientMessageId": message.id,
                "conversationId": "c1",
                "toUserId": "u2",
                "content": "Hello world!"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "id": message.id, "conversationId": "c1", "fromUserId": "u1", "toUserId": "u2",
                    "type": "text", "content": "Hello world!", "createdAt": message.created_at,
                    "status": "sent"
                }
            })))
            .mount(&server)
            .await;

        let saved = api(&server, StaticAuth::new("u1", "t"))
            .send_message(&message)
            .await
            .unwrap();
        assert_eq!(saved.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_error_envelope_maps_to_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/conversations"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "success": false,
                "error": {"code": "USER_NOT_MATCHED", "message": "not matched"}
            })))
            .mount(&server)
            .await;

        let err = api(&server, StaticAuth::new("u1", "t"))
            .create_conversation("u9")
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::UserNotMatched);
    }

    #[tokio::test]
    async fn test_plain_server_error_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/conversations/c1"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let err = api(&server, StaticAuth::new("u1", "t"))
            .delete_conversation("c1")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DeliveryError::Http {
                status: 503,
                message: "upstream unavailable".into()
            }
        );
        assert_eq!(err.code(), ErrorCode::ServerError);
    }

    #[tokio::test]
    async fn test_signed_out_never_calls_backend() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = api(&server, StaticAuth::signed_out())
            .get_conversations()
            .await
            .unwrap_err();
        assert_eq!(err, DeliveryError::Unauthorized);
    }

    #[tokio::test]
    async fn test_voice_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/voice/v1/url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {"url": "https://cdn/v1.m4a"}
            })))
            .mount(&server)
            .await;

        let url = api(&server, StaticAuth::new("u1", "t"))
            .get_voice_message_url("v1")
            .await
            .unwrap();
        assert_eq!(url, "https://cdn/v1.m4a");
    }
}
