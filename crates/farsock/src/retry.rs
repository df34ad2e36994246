//! Bounded retry with pluggable backoff.
//!
//! Two shapes of backoff appear in the acquisition pipeline:
//! delay-between-attempts (directory operations) and
//! timeout-growth-per-attempt with no delay (ping and broadcast rounds).
//! Both are expressed as a [`BackoffPolicy`] so call sites share one loop.

use std::future::Future;
use std::time::Duration;

use farsock_wire::FaultCode;
use tokio_util::sync::CancellationToken;

use crate::error::ProxyError;

/// How to space retry attempts.
#[derive(Debug, Clone, Copy)]
pub enum BackoffPolicy {
    /// Sleep `base * attempt` between attempts; constant per-attempt timeout.
    Linear { base: Duration },
    /// No sleep; the per-attempt timeout is `base * (attempt + 1)`.
    EscalatingTimeout { base: Duration },
}

impl BackoffPolicy {
    /// Delay before retrying after attempt `attempt` (0-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Linear { base } => *base * (attempt + 1),
            BackoffPolicy::EscalatingTimeout { .. } => Duration::ZERO,
        }
    }

    /// Timeout budget for attempt `attempt` (0-based).
    pub fn attempt_timeout(&self, attempt: u32) -> Duration {
        match self {
            BackoffPolicy::Linear { base } => *base,
            BackoffPolicy::EscalatingTimeout { base } => *base * (attempt + 1),
        }
    }
}

/// Bounded retry configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

/// Which faults are worth another attempt.
///
/// The unicast and broadcast paths classify differently, so the predicate is
/// configuration rather than a hard-coded rule at one call site.
#[derive(Debug, Clone, Copy)]
pub enum RetryPredicate {
    /// Retry timeouts and unreachable hosts; `Closed` is terminal.
    Unicast,
    /// Retry everything except `Closed` and cancellation.
    Broadcast,
    /// Retry only transient directory faults.
    Directory,
    Custom(fn(&ProxyError) -> bool),
}

impl RetryPredicate {
    pub fn should_retry(&self, error: &ProxyError) -> bool {
        match self {
            RetryPredicate::Unicast => matches!(
                error,
                ProxyError::Timeout
                    | ProxyError::NotFound
                    | ProxyError::Socket(FaultCode::Timeout)
                    | ProxyError::Socket(FaultCode::NoHost)
            ),
            RetryPredicate::Broadcast => {
                !error.is_cancelled() && !error.is_closed()
            }
            RetryPredicate::Directory => matches!(error, ProxyError::Transient(_)),
            RetryPredicate::Custom(f) => f(error),
        }
    }
}

/// Run `op` up to `policy.max_attempts` times.
///
/// The operation receives the 0-based attempt index and that attempt's
/// timeout budget. Non-retryable errors and the final attempt's error are
/// returned as-is; cancellation aborts between attempts.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    predicate: RetryPredicate,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ProxyError>
where
    F: FnMut(u32, Duration) -> Fut,
    Fut: Future<Output = Result<T, ProxyError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last = ProxyError::NotFound;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(ProxyError::Cancelled);
        }

        match op(attempt, policy.backoff.attempt_timeout(attempt)).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !predicate.should_retry(&err) || attempt + 1 == attempts {
                    return Err(err);
                }
                tracing::debug!(attempt, error = %err, "retry: attempt failed");
                last = err;
            }
        }

        let delay = policy.backoff.delay(attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffPolicy::EscalatingTimeout {
                base: Duration::from_millis(10),
            },
        }
    }

    #[tokio::test]
    async fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = retry(quick(5), RetryPredicate::Unicast, &CancellationToken::new(), |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, ProxyError>(7u32) }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry(quick(3), RetryPredicate::Unicast, &CancellationToken::new(), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProxyError::Timeout) }
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry(quick(5), RetryPredicate::Unicast, &CancellationToken::new(), |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProxyError::Socket(FaultCode::Closed)) }
            })
            .await;
        assert!(result.unwrap_err().is_closed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            retry(quick(5), RetryPredicate::Unicast, &cancel, |_, _| async {
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn escalating_timeout_grows() {
        let base = Duration::from_millis(100);
        let policy = BackoffPolicy::EscalatingTimeout { base };
        assert_eq!(policy.attempt_timeout(0), base);
        assert_eq!(policy.attempt_timeout(2), base * 3);
        assert_eq!(policy.delay(2), Duration::ZERO);
    }

    #[tokio::test]
    async fn linear_backoff_delays() {
        let base = Duration::from_millis(20);
        let policy = BackoffPolicy::Linear { base };
        assert_eq!(policy.delay(0), base);
        assert_eq!(policy.delay(1), base * 2);
        assert_eq!(policy.attempt_timeout(3), base);
    }

    #[test]
    fn predicate_classification() {
        assert!(RetryPredicate::Unicast.should_retry(&ProxyError::Timeout));
        assert!(!RetryPredicate::Unicast
            .should_retry(&ProxyError::Socket(FaultCode::Closed)));
        assert!(RetryPredicate::Broadcast.should_retry(&ProxyError::Timeout));
        assert!(!RetryPredicate::Broadcast
            .should_retry(&ProxyError::Socket(FaultCode::Closed)));
        assert!(!RetryPredicate::Broadcast.should_retry(&ProxyError::Cancelled));
        assert!(RetryPredicate::Directory
            .should_retry(&ProxyError::Transient("busy".into())));
        assert!(!RetryPredicate::Directory.should_retry(&ProxyError::Timeout));
    }
}
