//! Bounded exponential backoff for outbound writes.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{ProviderError, ProviderResult};

/// HTTP statuses that make an error terminal when no code says otherwise.
const TERMINAL_STATUSES: &[u16] = &[400, 401, 403, 404, 409, 412, 422];

/// Attempt count and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base, 2x base, 4x base ... capped.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Returns true if retrying the operation can never succeed.
pub fn is_terminal(error: &ProviderError) -> bool {
    if error.code().is_terminal() {
        return true;
    }
    if let Some(status) = error.status() {
        return TERMINAL_STATUSES.contains(&status);
    }
    error
        .message()
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|token| token.parse::<u16>().ok())
        .any(|status| TERMINAL_STATUSES.contains(&status))
}

/// Runs fallible async operations under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The last error is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, mut operation: F, name: &str, source_id: &str) -> ProviderResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = name, source_id, attempt, "Operation recovered after retry");
                    } else {
                        debug!(operation = name, source_id, "Operation succeeded");
                    }
                    return Ok(value);
                }
                Err(e) if is_terminal(&e) => {
                    debug!(operation = name, source_id, attempt, error = %e, "Terminal error, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(operation = name, source_id, attempts = attempt, error = %e, "Retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        operation = name,
                        source_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn terminal_classification() {
        assert!(is_terminal(&ProviderError::validation("bad title")));
        assert!(is_terminal(&ProviderError::from_status(412, "PUT")));
        assert!(is_terminal(&ProviderError::internal("remote said 409 Conflict")));
        assert!(!is_terminal(&ProviderError::server("HTTP 503")));
        assert!(!is_terminal(&ProviderError::network("connection reset")));
        assert!(!is_terminal(&ProviderError::internal("error 4090 in parser")));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::default();
        let counter = calls.clone();
        let result: ProviderResult<()> = executor
            .execute(
                || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(ProviderError::from_status(409, "PUT /a.ics")) }
                },
                "update_event",
                "caldav-1",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_recover() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::default();
        let counter = calls.clone();
        let started = tokio::time::Instant::now();
        let result = executor
            .execute(
                || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n < 3 {
                            Err(ProviderError::server("HTTP 503 PUT"))
                        } else {
                            Ok(n)
                        }
                    }
                },
                "create_event",
                "caldav-1",
            )
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::default();
        let counter = calls.clone();
        let result: ProviderResult<()> = executor
            .execute(
                || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(ProviderError::network(format!("attempt {}", n))) }
                },
                "delete_event",
                "caldav-1",
            )
            .await;

        assert_eq!(result.unwrap_err().message(), "attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
