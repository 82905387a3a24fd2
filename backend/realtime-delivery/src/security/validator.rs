use crate::auth::AuthProvider;
use crate::config::SecurityConfig;
use crate::error::{DeliveryError, DeliveryResult, ErrorCode};
use crate::models::{MessageType, OutboundMessage};
use crate::security::content::{find_harmful, find_spam};
use crate::security::rate_limiter::{RateLimiter, Reservation};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

const VOICE_MIME_TYPES: &[&str] = &[
    "audio/aac",
    "audio/m4a",
    "audio/x-m4a",
    "audio/mp4",
    "audio/mpeg",
    "audio/ogg",
    "audio/wav",
    "audio/x-wav",
    "audio/webm",
];

const IMAGE_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/heic",
];

/// Who may message whom, answered by the social graph
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelationshipLookup: Send + Sync {
    /// Whether `user_id` has blocked `other_user_id`
    async fn is_blocked(&self, user_id: &str, other_user_id: &str) -> DeliveryResult<bool>;

    /// Whether the two users are a matched pair
    async fn is_matched(&self, user_id: &str, other_user_id: &str) -> DeliveryResult<bool>;
}

/// Every pair matched, nobody blocked
#[derive(Debug, Clone, Default)]
pub struct OpenRelationships;

#[async_trait]
impl RelationshipLookup for OpenRelationships {
    async fn is_blocked(&self, _user_id: &str, _other_user_id: &str) -> DeliveryResult<bool> {
        Ok(false)
    }

    async fn is_matched(&self, _user_id: &str, _other_user_id: &str) -> DeliveryResult<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid,
    Rejected(DeliveryError),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ValidationResult::Valid => None,
            ValidationResult::Rejected(e) => Some(e.code()),
        }
    }

    pub fn into_result(self) -> DeliveryResult<()> {
        match self {
            ValidationResult::Valid => Ok(()),
            ValidationResult::Rejected(e) => Err(e),
        }
    }
}

/// Gate for outbound messages.
///
/// Checks run in order and stop at the first failure: session, send rate,
/// relationship, content, attachment. Passing records the send with the
/// rate limiter.
pub struct SecurityValidator {
    auth: Arc<dyn AuthProvider>,
    relationships: Arc<dyn RelationshipLookup>,
    rate_limiter: Arc<RateLimiter>,
    config: SecurityConfig,
}

impl SecurityValidator {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        relationships: Arc<dyn RelationshipLookup>,
        rate_limiter: Arc<RateLimiter>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            auth,
            relationships,
            rate_limiter,
            config,
        }
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub async fn validate(&self, message: &OutboundMessage<'_>) -> ValidationResult {
        match self.run_checks(message).await {
            Ok(reservation) => {
                reservation.commit();
                ValidationResult::Valid
            }
            Err(e) => {
                warn!(
                    code = %e.code(),
                    from = %message.from_user_id,
                    to = %message.to_user_id,
                    error = %e,
                    "outbound message rejected"
                );
                ValidationResult::Rejected(e)
            }
        }
    }

    /// The send slot is held across the relationship lookup and released
    /// if any later check fails
    async fn run_checks(&self, message: &OutboundMessage<'_>) -> DeliveryResult<Reservation<'_>> {
        self.check_session(message).await?;
        let reservation = self.reserve_send()?;
        self.check_relationship(message).await?;
        self.check_content(message)?;
        self.check_attachment(message)?;
        Ok(reservation)
    }

    async fn check_session(&self, message: &OutboundMessage<'_>) -> DeliveryResult<()> {
        let session = self
            .auth
            .current_session()
            .await
            .ok_or(DeliveryError::Unauthorized)?;
        if session.is_expired() {
            return Err(DeliveryError::TokenExpired);
        }
        if session.user_id != message.from_user_id {
            debug!(
                session_user = %session.user_id,
                sender = %message.from_user_id,
                "sender does not match session"
            );
            return Err(DeliveryError::Unauthorized);
        }
        Ok(())
    }

    fn reserve_send(&self) -> DeliveryResult<Reservation<'_>> {
        self.rate_limiter
            .try_acquire()
            .ok_or_else(|| DeliveryError::RateLimitExceeded {
                retry_after: self.rate_limiter.retry_after(),
            })
    }

    async fn check_relationship(&self, message: &OutboundMessage<'_>) -> DeliveryResult<()> {
        let (from, to) = (message.from_user_id, message.to_user_id);
        if self.relationships.is_blocked(from, to).await?
            || self.relationships.is_blocked(to, from).await?
        {
            return Err(DeliveryError::UserBlocked);
        }
        if !self.relationships.is_matched(from, to).await? {
            return Err(DeliveryError::UserNotMatched);
        }
        Ok(())
    }

    fn check_content(&self, message: &OutboundMessage<'_>) -> DeliveryResult<()> {
        if let Some(pattern) = find_harmful(message.content) {
            return Err(DeliveryError::Validation(format!(
                "content contains a disallowed {pattern}"
            )));
        }

        if message.message_type != MessageType::Text {
            return Ok(());
        }

        let text = message.content.trim();
        if text.is_empty() {
            return Err(DeliveryError::Validation("message is empty".into()));
        }
        let length = text.chars().count();
        if length > self.config.max_text_length {
            return Err(DeliveryError::Validation(format!(
                "message is {length} characters, limit is {}",
                self.config.max_text_length
            )));
        }
        if let Some(reason) = find_spam(text) {
            return Err(DeliveryError::Validation(format!(
                "message looks like spam: {reason}"
            )));
        }
        Ok(())
    }

    fn check_attachment(&self, message: &OutboundMessage<'_>) -> DeliveryResult<()> {
        let (allowed, max_bytes) = match message.message_type {
            MessageType::Text => {
                return match message.attachment {
                    Some(_) => Err(DeliveryError::Validation(
                        "text messages cannot carry attachments".into(),
                    )),
                    None => Ok(()),
                };
            }
            MessageType::Voice => (VOICE_MIME_TYPES, self.config.max_voice_bytes),
            MessageType::Image => (IMAGE_MIME_TYPES, self.config.max_image_bytes),
        };

        let kind = message.message_type.as_str();
        let attachment = message
            .attachment
            .ok_or_else(|| DeliveryError::Validation(format!("{kind} message has no attachment")))?;

        let mime = attachment.mime_type.to_ascii_lowercase();
        if !allowed.contains(&mime.as_str()) {
            return Err(DeliveryError::Validation(format!(
                "unsupported {kind} type {}",
                attachment.mime_type
            )));
        }
        if attachment.file_size == 0 {
            return Err(DeliveryError::Validation(format!("{kind} file is empty")));
        }
        if attachment.file_size > max_bytes {
            return Err(DeliveryError::Validation(format!(
                "file size {} exceeds {kind} limit of {max_bytes} bytes",
                attachment.file_size
            )));
        }
        if message.message_type == MessageType::Voice {
            if let Some(duration) = attachment.duration {
                if duration > self.config.max_voice_duration_secs {
                    return Err(DeliveryError::Validation(format!(
                        "voice message is {duration}s, limit is {}s",
                        self.config.max_voice_duration_secs
                    )));
                }
            }
        }
        Ok(())
    }
}
