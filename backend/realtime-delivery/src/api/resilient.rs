use crate::api::{Conversation, MessageQuery, MessagingApi, VoiceUploadUrl};
use crate::error::{DeliveryError, DeliveryResult};
use crate::models::Message;
use crate::websocket::frames::ReceiptStatus;
use async_trait::async_trait;
use resilience::{
    default_policy, message_fetch_policy, message_send_policy, rest_circuit_breaker, voice_policy,
    CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, CircuitState, RetryPolicy,
};
use std::future::Future;
use std::sync::Arc;

/// Retry policy per operation class
#[derive(Debug, Clone)]
pub struct PolicySet {
    pub send: RetryPolicy,
    pub fetch: RetryPolicy,
    pub voice: RetryPolicy,
    pub other: RetryPolicy,
}

impl Default for PolicySet {
    fn default() -> Self {
        Self {
            send: message_send_policy(),
            fetch: message_fetch_policy(),
            voice: voice_policy(),
            other: default_policy(),
        }
    }
}

/// Any `MessagingApi` behind retries and one circuit breaker per operation.
///
/// Each attempt passes through the breaker, so an opened breaker ends the
/// retry loop at once. Permanent errors (auth, validation, relationship)
/// are returned without counting against the breaker.
pub struct ResilientMessagingApi {
    inner: Arc<dyn MessagingApi>,
    breakers: CircuitBreakerRegistry,
    policies: PolicySet,
}

impl ResilientMessagingApi {
    pub fn new(inner: Arc<dyn MessagingApi>) -> Self {
        Self::with_policies(inner, rest_circuit_breaker(), PolicySet::default())
    }

    pub fn with_policies(
        inner: Arc<dyn MessagingApi>,
        breaker: CircuitBreakerConfig,
        policies: PolicySet,
    ) -> Self {
        Self {
            inner,
            breakers: CircuitBreakerRegistry::new(breaker),
            policies,
        }
    }

    /// Breakers that have seen traffic, by operation key
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.breakers.states()
    }

    async fn guarded<T, F, Fut>(
        &self,
        operation: &'static str,
        policy: &RetryPolicy,
        op: F,
    ) -> DeliveryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DeliveryResult<T>>,
    {
        let breaker = self.breakers.get(operation);
        let (breaker, op) = (&breaker, &op);

        policy
            .execute(operation, move || async move {
                let outcome = breaker
                    .call(|| async move {
                        match op().await {
                            Err(e) if e.is_permanent() => Ok(Err(e)),
                            other => other.map(Ok),
                        }
                    })
                    .await;
                match outcome {
                    Ok(result) => result,
                    Err(CircuitBreakerError::Open { key }) => {
                        Err(DeliveryError::CircuitBreakerOpen(key))
                    }
                    Err(CircuitBreakerError::Inner(e)) => Err(e),
                }
            })
            .await
    }
}

#[async_trait]
impl MessagingApi for ResilientMessagingApi {
    async fn get_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> DeliveryResult<Vec<Message>> {
        self.guarded("messages.fetch", &self.policies.fetch, || {
            self.inner.get_messages(conversation_id, query)
        })
        .await
    }

    async fn send_message(&self, message: &Message) -> DeliveryResult<Message> {
        self.guarded("messages.send", &self.policies.send, || {
            self.inner.send_message(message)
        })
        .await
    }

    async fn mark_conversation_as_read(&self, conversation_id: &str) -> DeliveryResult<()> {
        self.guarded("conversations.read", &self.policies.other, || {
            self.inner.mark_conversation_as_read(conversation_id)
        })
        .await
    }

    async fn generate_voice_upload_url(
        &self,
        conversation_id: &str,
        mime_type: &str,
        file_size: u64,
    ) -> DeliveryResult<VoiceUploadUrl> {
        self.guarded("voice.upload_url", &self.policies.voice, || {
            self.inner
                .generate_voice_upload_url(conversation_id, mime_type, file_size)
        })
        .await
    }

    async fn get_voice_message_url(&self, storage_id: &str) -> DeliveryResult<String> {
        self.guarded("voice.url", &self.policies.voice, || {
            self.inner.get_voice_message_url(storage_id)
        })
        .await
    }

    async fn send_typing_indicator(
        &self,
        conversation_id: &str,
        is_typing: bool,
    ) -> DeliveryResult<()> {
        self.guarded("typing", &self.policies.other, || {
            self.inner.send_typing_indicator(conversation_id, is_typing)
        })
        .await
    }

    async fn send_delivery_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        status: ReceiptStatus,
    ) -> DeliveryResult<()> {
        self.guarded("receipts", &self.policies.other, || {
            self.inner
                .send_delivery_receipt(conversation_id, message_id, status)
        })
        .await
    }

    async fn get_conversations(&self) -> DeliveryResult<Vec<Conversation>> {
        self.guarded("conversations.list", &self.policies.fetch, || {
            self.inner.get_conversations()
        })
        .await
    }

    async fn create_conversation(&self, participant_id: &str) -> DeliveryResult<Conversation> {
        self.guarded("conversations.create", &self.policies.other, || {
            self.inner.create_conversation(participant_id)
        })
        .await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> DeliveryResult<()> {
        self.guarded("conversations.delete", &self.policies.other, || {
            self.inner.delete_conversation(conversation_id)
        })
        .await
    }
}
