/// Preset retry policies per operation class
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::retry::{RetryClass, RetryConfig, RetryPolicy};
use std::time::Duration;

/// Message send
///
/// - Retry: 2 attempts, 2s base delay
/// - Only 5xx and transport errors (a retried 429/408 may duplicate the send)
pub fn message_send_policy() -> RetryPolicy {
    RetryPolicy {
        name: "message_send",
        config: RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
        },
        class: RetryClass::ServerAndTransport,
    }
}

/// Message fetch (idempotent reads)
///
/// - Retry: 4 attempts, 1s base delay
/// - Standard classification
pub fn message_fetch_policy() -> RetryPolicy {
    RetryPolicy {
        name: "message_fetch",
        config: RetryConfig {
            max_retries: 4,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
        },
        class: RetryClass::Standard,
    }
}

/// Voice upload and playback URLs
///
/// - Retry: 3 attempts, 3s base delay
/// - Payload-size rejections are final
pub fn voice_policy() -> RetryPolicy {
    RetryPolicy {
        name: "voice",
        config: RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(3000),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(1000),
        },
        class: RetryClass::ExcludePayloadSize,
    }
}

/// Everything else (conversation management, receipts)
pub fn default_policy() -> RetryPolicy {
    RetryPolicy {
        name: "default",
        config: RetryConfig::default(),
        class: RetryClass::Standard,
    }
}

/// REST endpoints: 5 consecutive failures, 30s cooldown
pub fn rest_circuit_breaker() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: 5,
        reset_timeout: Duration::from_secs(30),
    }
}
