//! Timeout and retry wrapper for calls to the embedding and LLM services.

use std::fmt::Display;
use std::future::Future;

use crate::config::CallPolicy;
use crate::error::AppError;

/// Errors that may succeed if the same call is simply repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Run `operation` under `policy`: each attempt is bounded by the timeout,
/// transient failures and timeouts are retried up to `max_retries` times with
/// a linear backoff, and the final failure becomes `ServiceUnavailable`.
pub async fn call_with_retry<F, Fut, T, E>(
    service: &'static str,
    policy: &CallPolicy,
    operation: F,
) -> Result<T, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;
    loop {
        let (reason, retryable) = match tokio::time::timeout(policy.timeout(), operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => (e.to_string(), e.is_transient()),
            Err(_) => (
                format!("timed out after {}s", policy.timeout_secs),
                true,
            ),
        };

        if !retryable || attempt >= policy.max_retries {
            tracing::warn!(service, attempt = attempt + 1, error = %reason, "External call failed");
            return Err(AppError::unavailable(service, reason));
        }

        attempt += 1;
        let backoff = policy.backoff() * attempt;
        tracing::warn!(
            service,
            attempt,
            max = policy.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %reason,
            "Retrying after transient error"
        );
        tokio::time::sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug)]
    struct Flaky(bool);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn policy() -> CallPolicy {
        CallPolicy {
            timeout_secs: 1,
            max_retries: 1,
            backoff_ms: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_once() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = call_with_retry("test", &policy(), || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Flaky(true))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_one_retry() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = call_with_retry("test", &policy(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(true))
        })
        .await;
        assert!(matches!(
            result,
            Err(AppError::ServiceUnavailable { service: "test", .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = call_with_retry("test", &policy(), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(false))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_call_times_out() {
        let result: Result<(), _> = call_with_retry("llm", &policy(), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, Flaky>(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
