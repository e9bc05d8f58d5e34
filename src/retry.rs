//! Retry-with-backoff around outbound provider calls.
//!
//! The wrapper is generic over the operation, the error type and the
//! classification of failures.  Only transient rate limits are retried;
//! quota exhaustion and every other failure end the call after one
//! attempt.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Provider asked us to slow down; worth retrying after a pause.
    RateLimited,
    /// Billing-period quota is spent; retrying cannot help.
    QuotaExhausted,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: std::fmt::Display> {
    #[error("QUOTA_EXCEEDED: {0}")]
    QuotaExceeded(E),
    #[error("RATE_LIMIT: still rate limited after {attempts} attempts: {last}")]
    StillRateLimited { attempts: u32, last: E },
    #[error("{0}")]
    Failed(E),
}

/// Timer seam so backoff can be observed without real waiting.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `op` until it succeeds or the policy gives up.
pub async fn call_with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureClass,
{
    let mut retry = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match classify(&err) {
            FailureClass::QuotaExhausted => {
                tracing::warn!(error = %err, "provider quota exhausted, not retrying");
                return Err(RetryError::QuotaExceeded(err));
            }
            FailureClass::Fatal => return Err(RetryError::Failed(err)),
            FailureClass::RateLimited => {
                if retry >= policy.max_retries {
                    tracing::warn!(attempts = retry + 1, error = %err, "retry budget exhausted");
                    return Err(RetryError::StillRateLimited {
                        attempts: retry + 1,
                        last: err,
                    });
                }
                let delay = policy.delay_for(retry);
                tracing::warn!(
                    delay_ms = delay.as_millis() as u64,
                    retries_left = policy.max_retries - retry,
                    "rate limit hit, backing off"
                );
                sleeper.sleep(delay).await;
                retry += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn total(&self) -> Duration {
            self.slept.lock().unwrap().iter().sum()
        }
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Fake {
        Slow,
        Quota,
        Broken,
    }

    impl std::fmt::Display for Fake {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn classify(e: &Fake) -> FailureClass {
        match e {
            Fake::Slow => FailureClass::RateLimited,
            Fake::Quota => FailureClass::QuotaExhausted,
            Fake::Broken => FailureClass::Fatal,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_doubling_delays() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let out = call_with_retry(&policy(), &sleeper, classify, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Fake::Slow)
                } else {
                    Ok("third")
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), "third");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // base + 2 * base
        assert_eq!(sleeper.total(), Duration::from_millis(6000));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(2000), Duration::from_millis(4000)]
        );
    }

    #[tokio::test]
    async fn quota_fails_after_single_attempt() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = call_with_retry(&policy(), &sleeper, classify, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Fake::Quota) }
        })
        .await;
        assert!(matches!(out, Err(RetryError::QuotaExceeded(Fake::Quota))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sleeper.total(), Duration::ZERO);
    }

    #[tokio::test]
    async fn other_failures_propagate_untouched() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = call_with_retry(&policy(), &sleeper, classify, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Fake::Broken) }
        })
        .await;
        assert!(matches!(out, Err(RetryError::Failed(Fake::Broken))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_is_distinct_from_quota() {
        let sleeper = RecordingSleeper::default();
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = call_with_retry(&policy(), &sleeper, classify, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Fake::Slow) }
        })
        .await;
        match out {
            Err(RetryError::StillRateLimited { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, Fake::Slow);
            }
            other => panic!("unexpected outcome: {:?}", other.err()),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.total(), Duration::from_millis(2000 + 4000 + 8000));
    }

    #[test]
    fn delay_doubles() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(2000));
        assert_eq!(p.delay_for(2), Duration::from_millis(8000));
    }
}
