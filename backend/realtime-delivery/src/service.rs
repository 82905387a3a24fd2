//! # Messaging Service
//!
//! Owning facade over the delivery layer: one connection, the send gate,
//! the message cache and an optional REST backend.
//!
//! Sends go over the socket while it is connected. When it is not and a
//! REST backend is configured, messages are validated here and sent through
//! the backend's retry and breaker policies instead; the cached copy ends up
//! `sent` or `failed`. Without a REST backend, sends while offline are
//! queued by the connection.

use crate::api::{MessageQuery, MessagingApi, ResilientMessagingApi};
use crate::auth::AuthProvider;
use crate::cache::{CacheStats, MessageCache};
use crate::config::DeliveryConfig;
use crate::error::DeliveryResult;
use crate::models::{now_millis, Message, MessageDraft, MessagePatch, MessageStatus};
use crate::security::{RateLimitStats, RateLimiter, RelationshipLookup, SecurityValidator};
use crate::websocket::{
    ConnectionHandlers, ConnectionManager, ConnectionState, DeliveryReceiptFrame, Frame,
    MessageFrame, ReadReceiptFrame, ReceiptStatus, SendOutcome, Transport, TypingFrame,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct MessagingService {
    user_id: String,
    connection: ConnectionManager,
    validator: Arc<SecurityValidator>,
    cache: Arc<MessageCache>,
    rest: Option<Arc<dyn MessagingApi>>,
}

impl MessagingService {
    /// `rest` is wrapped in the per-operation retry and breaker policies
    pub fn new(
        config: &DeliveryConfig,
        user_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        relationships: Arc<dyn RelationshipLookup>,
        rest: Option<Arc<dyn MessagingApi>>,
    ) -> Self {
        let cache = Arc::new(MessageCache::new(config.cache.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let validator = Arc::new(SecurityValidator::new(
            auth.clone(),
            relationships,
            rate_limiter,
            config.security.clone(),
        ));
        let connection = ConnectionManager::new(
            config.connection.clone(),
            config.batching.clone(),
            transport,
            auth,
            cache.clone(),
            Some(validator.clone()),
        );
        let rest = rest.map(|api| Arc::new(ResilientMessagingApi::new(api)) as Arc<dyn MessagingApi>);

        Self {
            user_id: user_id.into(),
            connection,
            validator,
            cache,
            rest,
        }
    }

    pub async fn start(&self, handlers: ConnectionHandlers) -> bool {
        info!(user_id = %self.user_id, rest_fallback = self.rest.is_some(), "starting messaging service");
        self.connection.initialize(&self.user_id, handlers).await
    }

    pub fn stop(&self) {
        info!(user_id = %self.user_id, "stopping messaging service");
        self.connection.disconnect();
    }

    /// Send a new message and return the local copy. A validation
    /// rejection leaves nothing in the cache.
    pub async fn send_message(&self, draft: MessageDraft) -> DeliveryResult<Message> {
        let message = draft.into_message(&self.user_id);

        if let Some(rest) = self.rest.as_ref().filter(|_| !self.connection.is_connected()) {
            return self.send_via_rest(rest.as_ref(), message).await;
        }

        // Cached before the write so the server echo finds it and acknowledges it
        self.cache
            .add_messages(&message.conversation_id, vec![message.clone()]);
        let outcome = match self
            .connection
            .send(Frame::Message(MessageFrame::from(&message)))
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.cache
                    .remove_message(&message.conversation_id, &message.id);
                return Err(e);
            }
        };
        debug!(message_id = %message.id, outcome = ?outcome, "message handed to connection");

        Ok(self
            .cache
            .get_message(&message.conversation_id, &message.id)
            .unwrap_or(message))
    }

    async fn send_via_rest(
        &self,
        rest: &dyn MessagingApi,
        mut message: Message,
    ) -> DeliveryResult<Message> {
        self.validator
            .validate(&(&message).into())
            .await
            .into_result()?;
        self.cache
            .add_messages(&message.conversation_id, vec![message.clone()]);

        match rest.send_message(&message).await {
            Ok(_) => {
                self.cache.advance_status(
                    &message.conversation_id,
                    &message.id,
                    MessageStatus::Sent,
                );
                message.status = MessageStatus::Sent;
                info!(message_id = %message.id, "message sent via rest fallback");
                Ok(message)
            }
            Err(e) => {
                self.cache.update_message(
                    &message.conversation_id,
                    &message.id,
                    &MessagePatch::status(MessageStatus::Failed),
                );
                warn!(message_id = %message.id, code = %e.code(), error = %e, "rest fallback send failed");
                Err(e)
            }
        }
    }

    pub async fn send_typing(
        &self,
        conversation_id: &str,
        is_typing: bool,
    ) -> DeliveryResult<SendOutcome> {
        self.connection
            .send(Frame::Typing(TypingFrame {
                conversation_id: conversation_id.to_string(),
                user_id: self.user_id.clone(),
                is_typing,
                timestamp: now_millis(),
            }))
            .await
    }

    pub async fn send_delivery_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> DeliveryResult<SendOutcome> {
        self.connection
            .send(Frame::DeliveryReceipt(DeliveryReceiptFrame {
                message_id: message_id.to_string(),
                conversation_id: conversation_id.to_string(),
                user_id: self.user_id.clone(),
                status: ReceiptStatus::Delivered,
                timestamp: now_millis(),
            }))
            .await
    }

    /// Tell the sender we read their message, and mark it read locally
    pub async fn send_read_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> DeliveryResult<SendOutcome> {
        let outcome = self
            .connection
            .send(Frame::ReadReceipt(ReadReceiptFrame {
                message_id: message_id.to_string(),
                conversation_id: conversation_id.to_string(),
                user_id: self.user_id.clone(),
                timestamp: now_millis(),
            }))
            .await?;
        self.cache
            .advance_status(conversation_id, message_id, MessageStatus::Read);
        Ok(outcome)
    }

    /// Cached history, or the latest page from the REST backend
    pub async fn load_messages(&self, conversation_id: &str) -> DeliveryResult<Vec<Message>> {
        if let Some(messages) = self.cache.get(conversation_id) {
            return Ok(messages);
        }
        let Some(rest) = &self.rest else {
            return Ok(Vec::new());
        };

        let messages = rest
            .get_messages(conversation_id, MessageQuery::default())
            .await?;
        debug!(conversation_id = %conversation_id, count = messages.len(), "history fetched");
        self.cache.set(conversation_id, messages);
        Ok(self.cache.get(conversation_id).unwrap_or_default())
    }

    pub fn search_messages(&self, conversation_id: &str, query: &str) -> Vec<Message> {
        self.cache.search_messages(conversation_id, query)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.get_stats()
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.validator.rate_limiter().get_stats()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// The policy-wrapped REST backend, when configured
    pub fn rest(&self) -> Option<&Arc<dyn MessagingApi>> {
        self.rest.as_ref()
    }
}
