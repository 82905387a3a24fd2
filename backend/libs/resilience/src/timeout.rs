/// Hard deadlines for async operations
use crate::metrics;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("Operation timed out after {0:?}")]
    Elapsed(Duration),
    #[error("{0}")]
    Inner(E),
}

/// Execute a fallible future, failing with `Elapsed` once `duration` passes.
///
/// The future is dropped on expiry.
pub async fn with_timeout<F, T, E>(duration: Duration, future: F) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(result)) => {
            metrics::deadline("success");
            Ok(result)
        }
        Ok(Err(e)) => {
            metrics::deadline("failure");
            Err(TimeoutError::Inner(e))
        }
        Err(_) => {
            metrics::deadline("elapsed");
            Err(TimeoutError::Elapsed(duration))
        }
    }
}
