use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Refresh 5 minutes before expiry
const DEFAULT_REFRESH_THRESHOLD: Duration = Duration::from_secs(300);

/// Minimum sleep between refresh-loop wakeups
const MIN_REFRESH_SLEEP: Duration = Duration::from_secs(60);

/// Capability for obtaining a replacement bearer token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String>;
}

/// Stored token with derived expiry metadata
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_threshold: Duration,
}

impl TokenInfo {
    fn new(token: String) -> Self {
        let expires_at = decode_expiry(&token)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::hours(24));
        Self {
            token,
            issued_at: Utc::now(),
            expires_at,
            refresh_threshold: DEFAULT_REFRESH_THRESHOLD,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn needs_refresh(&self) -> bool {
        let threshold =
            chrono::Duration::from_std(self.refresh_threshold).unwrap_or(chrono::Duration::zero());
        Utc::now() >= self.expires_at - threshold
    }

    pub fn time_until_expiry(&self) -> Duration {
        (self.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

struct TokenEntry {
    info: TokenInfo,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

type TokenMap = Arc<Mutex<HashMap<String, TokenEntry>>>;

/// Per-service bearer-token store with proactive background refresh.
///
/// No await happens while the token map is locked; refresh calls run
/// outside the lock and write their result back afterwards.
pub struct TokenStore {
    tokens: TokenMap,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Store a token; with a refresher, a background task keeps it fresh
    pub async fn store(
        &self,
        service: &str,
        token: String,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Result<()> {
        let info = TokenInfo::new(token);
        let expires_at = info.expires_at;
        let has_refresher = refresher.is_some();

        {
            let mut tokens = self.tokens.lock().await;
            tokens.insert(service.to_string(), TokenEntry { info, refresher });
        }

        if has_refresher {
            self.start_refresh_task(service).await;
        }

        info!(service = service, expires_at = %expires_at, "Token stored");
        Ok(())
    }

    /// Get a valid token.
    ///
    /// Returns `None` when absent, or expired with refresh disabled or
    /// failing. A token inside its refresh window is returned as-is while
    /// a background refresh is scheduled.
    pub async fn get(&self, service: &str, auto_refresh: bool) -> Option<String> {
        let snapshot = {
            let tokens = self.tokens.lock().await;
            tokens
                .get(service)
                .map(|entry| (entry.info.clone(), entry.refresher.is_some()))
        };

        let (info, has_refresher) = match snapshot {
            Some(s) => s,
            None => {
                warn!(service = service, "No token stored");
                return None;
            }
        };

        if info.is_expired() {
            warn!(service = service, "Stored token is expired");
            if auto_refresh && has_refresher && refresh_service(&self.tokens, service).await {
                let tokens = self.tokens.lock().await;
                return tokens.get(service).map(|entry| entry.info.token.clone());
            }
            return None;
        }

        if auto_refresh && has_refresher && info.needs_refresh() {
            debug!(service = service, "Token entering refresh window");
            let tokens = Arc::clone(&self.tokens);
            let service = service.to_string();
            tokio::spawn(async move {
                refresh_service(&tokens, &service).await;
            });
        }

        Some(info.token)
    }

    /// Remove a token and stop its refresh task
    pub async fn remove(&self, service: &str) {
        {
            let mut tokens = self.tokens.lock().await;
            tokens.remove(service);
        }

        let mut tasks = self.tasks.lock().await;
        if let Some(task) = tasks.remove(service) {
            task.abort();
        }

        info!(service = service, "Token removed");
    }

    pub async fn info(&self, service: &str) -> Option<TokenInfo> {
        let tokens = self.tokens.lock().await;
        tokens.get(service).map(|entry| entry.info.clone())
    }

    /// Abort all refresh tasks and drop all tokens
    pub async fn cleanup(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            for (_, task) in tasks.drain() {
                task.abort();
            }
        }

        let mut tokens = self.tokens.lock().await;
        tokens.clear();
        info!("Token store cleaned up");
    }

    async fn start_refresh_task(&self, service: &str) {
        let mut tasks = self.tasks.lock().await;

        if let Some(existing) = tasks.remove(service) {
            existing.abort();
        }

        let tokens = Arc::clone(&self.tokens);
        let name = service.to_string();
        let handle = tokio::spawn(async move {
            refresh_loop(tokens, name).await;
        });

        tasks.insert(service.to_string(), handle);
    }
}

/// Background loop: sleep until the refresh window, then refresh
async fn refresh_loop(tokens: TokenMap, service: String) {
    loop {
        let sleep_for = {
            let guard = tokens.lock().await;
            match guard.get(&service) {
                Some(entry) => {
                    let until_expiry = entry.info.time_until_expiry();
                    let threshold = entry.info.refresh_threshold;
                    until_expiry
                        .checked_sub(threshold)
                        .unwrap_or(Duration::ZERO)
                        .max(MIN_REFRESH_SLEEP)
                }
                None => break,
            }
        };

        tokio::time::sleep(sleep_for).await;

        let due = {
            let guard = tokens.lock().await;
            match guard.get(&service) {
                Some(entry) => entry.info.needs_refresh(),
                None => break,
            }
        };

        if due {
            refresh_service(&tokens, &service).await;
        }
    }

    debug!(service = %service, "Refresh loop finished");
}

/// Refresh one service's token via its registered refresher
async fn refresh_service(tokens: &Mutex<HashMap<String, TokenEntry>>, service: &str) -> bool {
    let refresher = {
        let guard = tokens.lock().await;
        match guard.get(service).and_then(|entry| entry.refresher.clone()) {
            Some(r) => r,
            None => {
                error!(service = service, "No refresh capability registered");
                return false;
            }
        }
    };

    info!(service = service, "Refreshing token");
    match refresher.refresh().await {
        Ok(new_token) => {
            let mut guard = tokens.lock().await;
            if let Some(entry) = guard.get_mut(service) {
                entry.info = TokenInfo::new(new_token);
                info!(service = service, "Token refreshed");
                return true;
            }
            false
        }
        Err(e) => {
            error!(service = service, error = %e, "Token refresh failed");
            false
        }
    }
}

/// Read `exp` from a JWT payload without verifying the signature
fn decode_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}
