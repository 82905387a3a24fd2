use resilience::ErrorShape;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type DeliveryResult<T> = Result<T, DeliveryError>;

/// Error taxonomy shared with the REST backend's error envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    ConnectionTimeout,
    ServerError,
    Unauthorized,
    TokenExpired,
    RateLimitExceeded,
    UserBlocked,
    UserNotMatched,
    ValidationError,
    CircuitBreakerOpen,
    #[serde(other)]
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::UserBlocked => "USER_BLOCKED",
            ErrorCode::UserNotMatched => "USER_NOT_MATCHED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeliveryError {
    #[error("network error: {0}")]
    Network(String),

    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// Non-success HTTP response or backend error envelope
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// Error envelope without a usable status
    #[error("{code}: {message}")]
    Api { code: ErrorCode, message: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("token expired")]
    TokenExpired,

    /// Client-side send cadence exceeded
    #[error("rate limit exceeded, retry in {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    #[error("user is blocked")]
    UserBlocked,

    #[error("users are not matched")]
    UserNotMatched,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("circuit breaker '{0}' is open")]
    CircuitBreakerOpen(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("not connected")]
    NotConnected,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl DeliveryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DeliveryError::Network(_) | DeliveryError::NotConnected => ErrorCode::NetworkError,
            DeliveryError::ConnectionTimeout(_) => ErrorCode::ConnectionTimeout,
            DeliveryError::Http { status, .. } => match status {
                401 => ErrorCode::Unauthorized,
                403 => ErrorCode::Unauthorized,
                408 => ErrorCode::ConnectionTimeout,
                429 => ErrorCode::RateLimitExceeded,
                400 | 413 | 422 => ErrorCode::ValidationError,
                500..=599 => ErrorCode::ServerError,
                _ => ErrorCode::UnknownError,
            },
            DeliveryError::Api { code, .. } => *code,
            DeliveryError::Unauthorized => ErrorCode::Unauthorized,
            DeliveryError::TokenExpired => ErrorCode::TokenExpired,
            DeliveryError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            DeliveryError::UserBlocked => ErrorCode::UserBlocked,
            DeliveryError::UserNotMatched => ErrorCode::UserNotMatched,
            DeliveryError::Validation(_) | DeliveryError::MalformedFrame(_) => {
                ErrorCode::ValidationError
            }
            DeliveryError::CircuitBreakerOpen(_) => ErrorCode::CircuitBreakerOpen,
            DeliveryError::ReconnectExhausted(_) => ErrorCode::NetworkError,
            DeliveryError::Config(_) | DeliveryError::Unknown(_) => ErrorCode::UnknownError,
        }
    }

    /// Map a backend error envelope onto the richest local variant
    pub fn from_envelope(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            ErrorCode::NetworkError => DeliveryError::Network(message),
            ErrorCode::Unauthorized => DeliveryError::Unauthorized,
            ErrorCode::TokenExpired => DeliveryError::TokenExpired,
            ErrorCode::UserBlocked => DeliveryError::UserBlocked,
            ErrorCode::UserNotMatched => DeliveryError::UserNotMatched,
            ErrorCode::ValidationError => DeliveryError::Validation(message),
            _ => DeliveryError::Api { code, message },
        }
    }

    /// Errors the caller must fix before resending; never retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Unauthorized
                | ErrorCode::TokenExpired
                | ErrorCode::UserBlocked
                | ErrorCode::UserNotMatched
                | ErrorCode::ValidationError
        ) || matches!(self, DeliveryError::RateLimitExceeded { .. })
    }
}

impl ErrorShape for DeliveryError {
    fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Http { status, .. } => Some(*status),
            DeliveryError::Api { code, .. } => match code {
                ErrorCode::ServerError => Some(500),
                ErrorCode::RateLimitExceeded => Some(429),
                _ => None,
            },
            DeliveryError::Unauthorized => Some(401),
            DeliveryError::TokenExpired => Some(401),
            DeliveryError::UserBlocked | DeliveryError::UserNotMatched => Some(403),
            DeliveryError::Validation(_) => Some(422),
            _ => None,
        }
    }

    fn is_transport(&self) -> bool {
        matches!(
            self,
            DeliveryError::Network(_) | DeliveryError::ConnectionTimeout(_)
        ) || matches!(
            self,
            DeliveryError::Api {
                code: ErrorCode::NetworkError | ErrorCode::ConnectionTimeout,
                ..
            }
        )
    }

    fn is_payload_too_large(&self) -> bool {
        match self {
            DeliveryError::Http { status: 413, .. } => true,
            DeliveryError::Http { message, .. } | DeliveryError::Validation(message) => {
                let lower = message.to_lowercase();
                lower.contains("too large") || lower.contains("file size")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::ConnectionTimeout(Duration::ZERO)
        } else if let Some(status) = e.status() {
            DeliveryError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            DeliveryError::Unknown(format!("invalid response body: {e}"))
        } else {
            DeliveryError::Network(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DeliveryError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Http(response) => DeliveryError::Http {
                status: response.status().as_u16(),
                message: "websocket upgrade rejected".to_string(),
            },
            other => DeliveryError::Network(other.to_string()),
        }
    }
}
