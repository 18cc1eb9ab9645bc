use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{ControlError, Result};
use crate::retry::{RetryConfig, RetryPolicy};

/// Per-pool HTTP client limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on idle keepalive connections per host
    pub max_keepalive: usize,
    /// Idle connection expiry
    pub keepalive_expiry: Duration,
    /// Request and connect timeout
    pub timeout: Duration,
    /// Verify TLS certificates
    pub verify_ssl: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_keepalive: 10,
            keepalive_expiry: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            verify_ssl: true,
        }
    }
}

/// Connection statistics for one pool
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time: Duration,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    pub fn average_response_time(&self) -> Duration {
        if self.successful_requests == 0 {
            return Duration::ZERO;
        }
        self.total_response_time / self.successful_requests as u32
    }
}

/// Bounded, timed HTTP client for one base URL.
///
/// No retry and no breaker at this layer. Server errors (5xx) are turned
/// into `ControlError::Api` so the resilience layers above observe them as
/// failures; other statuses pass through as responses.
#[derive(Debug)]
pub struct ConnectionPool {
    base_url: String,
    client: reqwest::Client,
    stats: Mutex<ConnectionStats>,
}

impl ConnectionPool {
    pub fn new(base_url: impl Into<String>, config: &PoolConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_keepalive)
            .pool_idle_timeout(config.keepalive_expiry)
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| ControlError::Configuration(format!("failed to build client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            stats: Mutex::new(ConnectionStats::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.lock().expect("stats mutex poisoned").clone()
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<&Value>,
        params: &[(String, String)],
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let started = Instant::now();

        {
            let mut stats = self.stats.lock().expect("stats mutex poisoned");
            stats.total_requests += 1;
            stats.last_request_time = Some(Utc::now());
        }
        counter!("control_http_requests_total", 1);

        let mut request = self.client.request(method.clone(), &url).headers(headers);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let outcome = request.send().await;

        match outcome {
            Ok(response) if response.status().is_server_error() => {
                self.record_failure();
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                error!(method = %method, url = %url, status = status, "Server error");
                counter!("control_http_failures_total", 1);
                Err(ControlError::Api {
                    message: format!("server error {}", status),
                    status,
                    body,
                })
            }
            Ok(response) => {
                let elapsed = started.elapsed();
                {
                    let mut stats = self.stats.lock().expect("stats mutex poisoned");
                    stats.successful_requests += 1;
                    stats.total_response_time += elapsed;
                }
                debug!(
                    method = %method,
                    url = %url,
                    status = response.status().as_u16(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request completed"
                );
                Ok(response)
            }
            Err(e) => {
                self.record_failure();
                counter!("control_http_failures_total", 1);
                error!(method = %method, url = %url, error = %e, "Request failed");
                Err(ControlError::Connection(e.to_string()))
            }
        }
    }

    fn record_failure(&self) {
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        stats.failed_requests += 1;
    }
}

/// Merged per-service statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_time: Duration,
    pub last_request_time: Option<DateTime<Utc>>,
    pub breaker_state: CircuitState,
    pub breaker_failures: u32,
}

struct ServiceHandle {
    pool: ConnectionPool,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

/// Per-service pools composed with retry and circuit breaking.
///
/// Composition order matches the request contract: the breaker wraps each
/// individual attempt, and the retry policy wraps the breaker.
pub struct ConnectionManager {
    services: DashMap<String, Arc<ServiceHandle>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    pub fn create_pool(
        &self,
        service: &str,
        base_url: &str,
        pool_config: PoolConfig,
        retry_config: RetryConfig,
        breaker_config: CircuitBreakerConfig,
    ) -> Result<()> {
        let handle = ServiceHandle {
            pool: ConnectionPool::new(base_url, &pool_config)?,
            retry: RetryPolicy::new(retry_config),
            breaker: CircuitBreaker::new(service, breaker_config),
        };

        self.services.insert(service.to_string(), Arc::new(handle));
        info!(service = service, base_url = base_url, "Connection pool created");
        Ok(())
    }

    pub fn has_pool(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn request(
        &self,
        service: &str,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Option<Value>,
        params: Vec<(String, String)>,
        use_retry: bool,
        use_breaker: bool,
    ) -> Result<reqwest::Response> {
        let handle = self
            .services
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ControlError::Configuration(format!(
                    "no connection pool for service '{}'",
                    service
                ))
            })?;

        let attempt = || {
            let handle = Arc::clone(&handle);
            let method = method.clone();
            let path = path.to_string();
            let headers = headers.clone();
            let body = body.clone();
            let params = params.clone();

            async move {
                let fut = handle
                    .pool
                    .request(method, &path, headers, body.as_ref(), &params);
                if use_breaker {
                    handle.breaker.call(fut).await
                } else {
                    fut.await
                }
            }
        };

        if use_retry {
            handle.retry.execute(attempt).await
        } else {
            attempt().await
        }
    }

    pub fn pool_stats(&self, service: &str) -> Option<PoolStats> {
        let handle = self.services.get(service)?;
        let stats = handle.pool.stats();

        Some(PoolStats {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            success_rate: stats.success_rate(),
            average_response_time: stats.average_response_time(),
            last_request_time: stats.last_request_time,
            breaker_state: handle.breaker.state(),
            breaker_failures: handle.breaker.failure_count(),
        })
    }

    pub fn list_pools(&self) -> Vec<String> {
        self.services.iter().map(|e| e.key().clone()).collect()
    }

    pub fn close_pool(&self, service: &str) {
        if self.services.remove(service).is_some() {
            info!(service = service, "Connection pool closed");
        }
    }

    pub fn close_all_pools(&self) {
        self.services.clear();
        info!("All connection pools closed");
    }
}
