use crate::error::EvalError;
use crate::models::EvalOptions;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_options(options: &EvalOptions) -> Self {
        Self {
            timeout: options.call_timeout,
            max_retries: options.max_retries,
            backoff: options.retry_backoff,
        }
    }

    /// Exponential backoff: base, 2x base, 4x base, ... capped at 32x.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff * (1u32 << attempt.saturating_sub(1).min(5))
    }
}

/// Wraps every call to an external provider: honours cancellation, bounds the
/// call with a timeout and retries transient failures.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }

    pub fn ensure_active(&self) -> Result<(), EvalError> {
        if self.cancel.is_cancelled() {
            Err(EvalError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn call<T, F, Fut>(&self, label: &'static str, mut operation: F) -> Result<T, EvalError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EvalError>>,
    {
        let mut attempt = 0u32;
        loop {
            self.ensure_active()?;

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return Err(EvalError::Cancelled),
                result = tokio::time::timeout(self.policy.timeout, operation()) => {
                    result.unwrap_or(Err(EvalError::Timeout(self.policy.timeout)))
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    warn!(call = label, attempt, ?delay, error = %error, "retrying external call");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(EvalError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn context(max_retries: u32) -> CallContext {
        CallContext::new(
            RetryPolicy {
                timeout: Duration::from_millis(200),
                max_retries,
                backoff: Duration::from_millis(1),
            },
            CancellationToken::new(),
        )
    }

    fn transient() -> EvalError {
        EvalError::Provider {
            provider: "fake".to_string(),
            details: "503".to_string(),
            transient: true,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let result = context(3)
            .call("fake", || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(7));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = context(3)
            .call("fake", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(EvalError::parse("fake", "not json"))
            })
            .await;

        assert!(matches!(result, Err(EvalError::Parse { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = context(2)
            .call("fake", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), _> = context(0)
            .call("fake", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(EvalError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancelled_context_makes_no_call() {
        let ctx = context(0);
        ctx.cancel.cancel();
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = ctx
            .call("fake", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(EvalError::Cancelled)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
