use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{info, warn};

use crate::error::{ControlError, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Cool-down before an open breaker admits a probe call
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Per-service circuit breaker.
///
/// State lives under a std mutex and is never held across an await; the
/// wrapped call runs between the admission check and the outcome record.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner
            .lock()
            .expect("breaker mutex poisoned")
            .failure_count
    }

    /// Admission check; transitions Open -> HalfOpen after the cool-down
    fn preflight(&self) -> Result<()> {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");

        if guard.state == CircuitState::Open {
            let recovered = guard
                .last_failure
                .map(|t| t.elapsed() >= self.config.recovery_timeout)
                .unwrap_or(true);

            if recovered {
                guard.state = CircuitState::HalfOpen;
                guard.success_count = 0;
                info!(service = %self.name, "Circuit breaker moved to half-open");
            } else {
                counter!("control_breaker_rejected_total", 1);
                return Err(ControlError::BreakerOpen(self.name.clone()));
            }
        }

        Ok(())
    }

    fn on_success(&self) {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");

        match guard.state {
            CircuitState::HalfOpen => {
                guard.success_count += 1;
                if guard.success_count >= self.config.success_threshold {
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    info!(service = %self.name, "Circuit breaker closed");
                    counter!("control_breaker_closed_total", 1);
                }
            }
            _ => {
                guard.failure_count = 0;
            }
        }
    }

    fn on_failure(&self) {
        let mut guard = self.inner.lock().expect("breaker mutex poisoned");
        guard.failure_count += 1;
        guard.last_failure = Some(Instant::now());

        match guard.state {
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                warn!(service = %self.name, "Circuit breaker reopened from half-open");
                counter!("control_breaker_opened_total", 1);
            }
            CircuitState::Closed if guard.failure_count >= self.config.failure_threshold => {
                guard.state = CircuitState::Open;
                warn!(
                    service = %self.name,
                    failures = guard.failure_count,
                    "Circuit breaker opened"
                );
                counter!("control_breaker_opened_total", 1);
            }
            _ => {}
        }
    }

    /// Execute a future under breaker protection
    pub async fn call<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.preflight()?;

        match fut.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }
}
