/// Retry policy with exponential backoff and jitter
use crate::metrics;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Classification hooks a caller's error type exposes to the retry policy
pub trait ErrorShape {
    /// HTTP-like status code, when the error came from a response
    fn status(&self) -> Option<u16>;

    /// Network failure or timeout before any response arrived
    fn is_transport(&self) -> bool;

    /// Request rejected because of its size
    fn is_payload_too_large(&self) -> bool {
        self.status() == Some(413)
    }
}

/// Retry on 5xx, 429, 408 and transport errors; never on validation or auth failures
pub fn default_should_retry<E: ErrorShape + ?Sized>(error: &E) -> bool {
    if error.is_transport() {
        return true;
    }

    match error.status() {
        Some(400 | 401 | 403 | 422) => false,
        Some(408 | 429) => true,
        Some(status) => (500..600).contains(&status),
        None => false,
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further retry
    pub base_delay: Duration,
    /// Upper bound for any single delay, jitter included
    pub max_delay: Duration,
    /// Random extra delay drawn uniformly from `0..=max_jitter`
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryConfig {
    /// `min(base_delay * 2^attempt + jitter, max_delay)`, `attempt` counted from 0
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };

        exponential.saturating_add(jitter).min(self.max_delay)
    }
}

/// Which failures a policy is willing to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// `default_should_retry`
    Standard,
    /// 5xx and transport errors only
    ServerAndTransport,
    /// Standard, minus payload-size rejections
    ExcludePayloadSize,
}

impl RetryClass {
    pub fn should_retry<E: ErrorShape + ?Sized>(&self, error: &E) -> bool {
        match self {
            RetryClass::Standard => default_should_retry(error),
            RetryClass::ServerAndTransport => {
                error.is_transport()
                    || matches!(error.status(), Some(status) if (500..600).contains(&status))
            }
            RetryClass::ExcludePayloadSize => {
                !error.is_payload_too_large() && default_should_retry(error)
            }
        }
    }
}

/// A named retry configuration plus its error classification
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub config: RetryConfig,
    pub class: RetryClass,
}

impl RetryPolicy {
    pub async fn execute<F, Fut, T, E>(&self, context: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ErrorShape + Display,
    {
        let class = self.class;
        execute_with_retry(op, context, &self.config, |e: &E| class.should_retry(e)).await
    }
}

/// Invoke `op` up to `max_retries + 1` times, sleeping between retryable failures.
///
/// The last error is returned unchanged once retries are exhausted or
/// `should_retry` rejects it.
pub async fn execute_with_retry<F, Fut, T, E, P>(
    mut op: F,
    context: &str,
    config: &RetryConfig,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        context = %context,
                        attempts = attempt + 1,
                        "operation succeeded after retry"
                    );
                }
                metrics::retry_settled(context, "success", attempt + 1);
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!(context = %context, error = %e, "error is not retryable");
                    metrics::retry_settled(context, "rejected", attempt + 1);
                    return Err(e);
                }

                if attempt >= config.max_retries {
                    warn!(
                        context = %context,
                        max_retries = config.max_retries,
                        error = %e,
                        "max retries reached"
                    );
                    metrics::retry_settled(context, "exhausted", attempt + 1);
                    return Err(e);
                }

                let delay = config.delay_for(attempt);

                warn!(
                    context = %context,
                    error = %e,
                    "Retry attempt {}/{}, waiting {:?}",
                    attempt + 1,
                    config.max_retries,
                    delay
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
