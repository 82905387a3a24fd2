/// Resilience patterns for the realtime delivery layer
///
/// This library provides:
/// - **Retry**: exponential backoff with jitter, with per-operation error classification
/// - **Circuit Breaker**: fails fast after consecutive failures, one trial call after cooldown
/// - **Timeout**: hard deadlines on connection establishment and other external calls
/// - **Presets**: tuned policies for message send, message fetch and voice operations
///
/// # Example: guarded REST call
///
/// ```rust,no_run
/// use resilience::{presets, CircuitBreaker, ErrorShape};
///
/// #[derive(Debug)]
/// struct HttpError(u16);
///
/// impl std::fmt::Display for HttpError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "http {}", self.0)
///     }
/// }
///
/// impl ErrorShape for HttpError {
///     fn status(&self) -> Option<u16> {
///         Some(self.0)
///     }
///     fn is_transport(&self) -> bool {
///         false
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new("messages.fetch", presets::rest_circuit_breaker());
///     let policy = presets::message_fetch_policy();
///
///     let result = breaker
///         .call(|| policy.execute("fetch conversation", || async { Ok::<_, HttpError>(()) }))
///         .await;
/// }
/// ```

pub mod circuit_breaker;
pub mod metrics;
pub mod presets;
pub mod retry;
pub mod timeout;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState,
};
pub use presets::{
    default_policy, message_fetch_policy, message_send_policy, rest_circuit_breaker, voice_policy,
};
pub use retry::{
    default_should_retry, execute_with_retry, ErrorShape, RetryClass, RetryConfig, RetryPolicy,
};
pub use timeout::{with_timeout, TimeoutError};
