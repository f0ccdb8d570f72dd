//! Retry with exponential backoff around transient provider failures.
//!
//! Rate limits, timeouts, and 5xx responses are worth retrying; parse
//! failures and auth errors are not. After the attempt cap the last failure
//! is returned as a value so the caller can record the absence.

use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::provider::{Completion, EvaluationFailure};

pub async fn with_retry<F, Fut>(
    config: &RetryConfig,
    provider: &str,
    operation: F,
) -> Result<Completion, EvaluationFailure>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Completion, EvaluationFailure>>,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(completion) => return Ok(completion),
            Err(failure) => {
                attempt += 1;

                if !failure.transient || attempt > config.max_retries {
                    return Err(failure);
                }

                let backoff_ms = std::cmp::min(
                    config.backoff_base_ms.saturating_mul(2u64.pow(attempt - 1)),
                    config.backoff_max_ms,
                );

                warn!(
                    provider,
                    attempt,
                    backoff_ms,
                    reason = %failure.reason,
                    "Retrying after transient provider failure"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}
