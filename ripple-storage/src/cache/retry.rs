//! Retry loop shared by queries and mutations.

use std::future::Future;

use ripple_core::{RemoteResult, RetryConfig};
use tracing::debug;

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget in `retry` is spent.
///
/// Only [`RemoteError::Transient`](ripple_core::RemoteError::Transient)
/// failures are retried. The delay before retry `n` is
/// `retry.backoff.delay_for_attempt(n)`.
pub async fn with_retry<T, F, Fut>(operation: &str, retry: &RetryConfig, mut call: F) -> RemoteResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && retry.allows_retry(attempt) => {
                let delay = retry.backoff.delay_for_attempt(attempt);
                debug!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
