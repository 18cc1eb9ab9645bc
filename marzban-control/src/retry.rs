use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, info, warn};

use crate::error::{ControlError, Result};

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Exponential growth factor
    pub exponential_base: f64,
    /// Apply a ±25% uniform jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// Executes an operation with capped exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retrying after the given 0-indexed failed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.config.exponential_base.powi(attempt as i32);
        let raw = self.config.base_delay.as_secs_f64() * exp;
        let mut delay = raw.min(self.config.max_delay.as_secs_f64());

        if self.config.jitter {
            let offset = delay * 0.25 * (2.0 * rand::thread_rng().gen::<f64>() - 1.0);
            delay += offset;
        }

        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Run `op`, retrying every error until attempts are exhausted.
    ///
    /// Error classification is the caller's concern; the last error is
    /// returned after the final attempt.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error: Option<ControlError> = None;

        for attempt in 0..self.config.max_attempts {
            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt + 1 < self.config.max_attempts {
                        let delay = self.delay_for_attempt(attempt);
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Attempt failed, retrying"
                        );
                        last_error = Some(e);
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(
                            attempts = self.config.max_attempts,
                            error = %e,
                            "All attempts failed"
                        );
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ControlError::Other("retry with zero attempts".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            exponential_base: 2.0,
            jitter: false,
        })
    }

    #[test]
    fn test_delays_monotonic_and_capped() {
        let policy = no_jitter(6);
        let delays: Vec<Duration> = (0..6).map(|i| policy.delay_for_attempt(i)).collect();

        for window in delays.windows(2) {
            assert!(window[1] >= window[0]);
        }
        for d in &delays {
            assert!(*d <= Duration::from_millis(40));
        }
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
        assert_eq!(delays[2], Duration::from_millis(40));
        assert_eq!(delays[5], Duration::from_millis(40));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            exponential_base: 1.0,
            jitter: true,
        });

        for _ in 0..100 {
            let d = policy.delay_for_attempt(0);
            assert!(d >= Duration::from_millis(75));
            assert!(d <= Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success_returns_immediately() {
        let policy = no_jitter(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let start = std::time::Instant::now();
        let result: Result<u32> = policy
            .execute(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let policy = no_jitter(4);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<&str> = policy
            .execute(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ControlError::Connection("refused".into()))
                    } else {
                        Ok("up")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "up");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_delay_never_exceeds_cap(
                attempt in 0u32..32,
                base_ms in 1u64..5_000,
                max_ms in 1u64..10_000,
            ) {
                let policy = RetryPolicy::new(RetryConfig {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(max_ms),
                    exponential_base: 2.0,
                    jitter: false,
                });

                prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(max_ms));
            }
        }
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let policy = no_jitter(3);
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result: Result<()> = policy
            .execute(|| {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(ControlError::Connection(format!("failure {}", n)))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ControlError::Connection(msg)) => assert_eq!(msg, "failure 2"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
