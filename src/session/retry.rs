//! Retry-with-backoff combinator.
//!
//! Login attempts against the third-party services are the only place in the
//! codebase that retries; every call site goes through [`retry_with_backoff`]
//! so the attempt count and backoff curve live in exactly one spot.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::SessionError;

/// Bounded-retry policy for session establishment.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub attempts: u32,
    /// Delay before the second attempt; doubles after every failure.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// Run `op` up to `policy.attempts` times, sleeping between attempts with
/// exponential backoff (1s, 2s, 4s, ... by default).
///
/// Only retryable failures are re-attempted — an [`InvalidCredentials`] or
/// [`NotConfigured`] outcome aborts immediately so a rejected secret is never
/// hammered against the remote.
///
/// [`InvalidCredentials`]: SessionError::InvalidCredentials
/// [`NotConfigured`]: SessionError::NotConfigured
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut delay = policy.initial_backoff;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                warn!(
                    "{what}: attempt {attempt}/{} failed, retrying in {}s: {e}",
                    policy.attempts,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_with_backoff() {
        let calls = AtomicU32::new(0);
        let begin = tokio::time::Instant::now();

        let result: Result<(), _> = retry_with_backoff(policy(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::transient("boom"))
        })
        .await;

        assert_eq!(result, Err(SessionError::transient("boom")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s before attempt 2, 2s before attempt 3
        assert_eq!(begin.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credentials_abort_after_one_attempt() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(policy(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::InvalidCredentials)
        })
        .await;

        assert_eq!(result, Err(SessionError::InvalidCredentials));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failure() {
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(policy(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SessionError::transient("first try loses"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
