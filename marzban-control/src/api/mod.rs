//! Panel API client: authentication dance, resilient request path and
//! response decoding. Typed node operations live in [`nodes`].

pub mod nodes;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerConfig;
use crate::config::MarzbanConfig;
use crate::error::{ControlError, Result};
use crate::pool::{ConnectionManager, PoolConfig, PoolStats};
use crate::retry::RetryConfig;
use crate::security::mask_secret;
use crate::token::{TokenRefresher, TokenStore};

/// Service name registered with the connection manager and token store
pub const PANEL_SERVICE: &str = "marzban";

/// Typed client for the panel's HTTP API
pub struct PanelClient {
    config: MarzbanConfig,
    manager: Arc<ConnectionManager>,
    tokens: Arc<TokenStore>,
}

impl PanelClient {
    /// Build a client and register its connection pool.
    ///
    /// Fails early when panel credentials are missing; the core never
    /// issues a request without them.
    pub fn new(
        config: MarzbanConfig,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
        manager: Arc<ConnectionManager>,
        tokens: Arc<TokenStore>,
    ) -> Result<Self> {
        if !config.is_configured() {
            return Err(ControlError::Configuration(
                "marzban base_url, username and password are required".to_string(),
            ));
        }

        if !manager.has_pool(PANEL_SERVICE) {
            let pool_config = PoolConfig {
                timeout: config.timeout(),
                verify_ssl: config.verify_ssl,
                ..PoolConfig::default()
            };
            manager.create_pool(PANEL_SERVICE, &config.base_url, pool_config, retry, breaker)?;
        }

        Ok(Self {
            config,
            manager,
            tokens,
        })
    }

    pub fn connection_stats(&self) -> Option<PoolStats> {
        self.manager.pool_stats(PANEL_SERVICE)
    }

    /// Authenticate and verify panel reachability
    pub async fn test_connection(&self) -> bool {
        match self.authenticate().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Panel connection test failed");
                false
            }
        }
    }

    /// Drop the pool and token for this client
    pub async fn close(&self) {
        self.manager.close_pool(PANEL_SERVICE);
        self.tokens.remove(PANEL_SERVICE).await;
    }

    pub(crate) async fn get(&self, endpoint: &str, params: Vec<(String, String)>) -> Result<Value> {
        self.request(Method::GET, endpoint, None, params, true).await
    }

    pub(crate) async fn post(&self, endpoint: &str, body: Option<Value>) -> Result<Value> {
        self.request(Method::POST, endpoint, body, Vec::new(), true)
            .await
    }

    pub(crate) async fn put(&self, endpoint: &str, body: Option<Value>) -> Result<Value> {
        self.request(Method::PUT, endpoint, body, Vec::new(), true)
            .await
    }

    pub(crate) async fn delete(&self, endpoint: &str) -> Result<Value> {
        self.request(Method::DELETE, endpoint, None, Vec::new(), true)
            .await
    }

    /// Resilient request with bearer auth and one-shot 401 recovery
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        params: Vec<(String, String)>,
        authenticated: bool,
    ) -> Result<Value> {
        let path = api_path(endpoint);

        let headers = if authenticated {
            let token = self.ensure_token().await?;
            auth_headers(&token)?
        } else {
            base_headers()
        };

        debug!(method = %method, path = %path, "Panel request");

        let response = self
            .manager
            .request(
                PANEL_SERVICE,
                method.clone(),
                &path,
                headers,
                body.clone(),
                params.clone(),
                true,
                true,
            )
            .await?;

        if authenticated && response.status().as_u16() == 401 {
            warn!(path = %path, "Got 401, forcing one token refresh");
            let token = self.authenticate().await.map_err(|e| {
                ControlError::Authentication(format!("failed to refresh authentication: {}", e))
            })?;

            let response = self
                .manager
                .request(
                    PANEL_SERVICE,
                    method,
                    &path,
                    auth_headers(&token)?,
                    body,
                    params,
                    false,
                    false,
                )
                .await?;
            return decode_response(response).await;
        }

        decode_response(response).await
    }

    /// Current token, authenticating from scratch when absent
    async fn ensure_token(&self) -> Result<String> {
        if let Some(token) = self.tokens.get(PANEL_SERVICE, true).await {
            return Ok(token);
        }
        self.authenticate().await
    }

    /// Authenticate and store the token with a re-authentication refresher
    async fn authenticate(&self) -> Result<String> {
        info!(
            username = %self.config.username,
            password = %mask_secret(&self.config.password, 2),
            "Authenticating with panel"
        );

        let token = request_token(&self.manager, &self.config, false).await?;

        let refresher = Arc::new(PanelRefresher {
            manager: Arc::clone(&self.manager),
            config: self.config.clone(),
        });
        self.tokens
            .store(PANEL_SERVICE, token.clone(), Some(refresher))
            .await?;

        info!("Authentication successful, token stored");
        Ok(token)
    }
}

/// Re-authentication capability handed to the token store
struct PanelRefresher {
    manager: Arc<ConnectionManager>,
    config: MarzbanConfig,
}

#[async_trait]
impl TokenRefresher for PanelRefresher {
    async fn refresh(&self) -> Result<String> {
        debug!("Refreshing panel token via re-authentication");
        request_token(&self.manager, &self.config, true).await
    }
}

/// POST /api/admin/token with the configured credentials
async fn request_token(
    manager: &ConnectionManager,
    config: &MarzbanConfig,
    use_retry: bool,
) -> Result<String> {
    let body = serde_json::json!({
        "username": config.username,
        "password": config.password,
    });

    let response = manager
        .request(
            PANEL_SERVICE,
            Method::POST,
            "/api/admin/token",
            base_headers(),
            Some(body),
            Vec::new(),
            use_retry,
            false,
        )
        .await?;

    let data = decode_response(response).await?;
    data.get("access_token")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ControlError::Authentication("no access token in response".to_string()))
}

fn api_path(endpoint: &str) -> String {
    if endpoint.starts_with("/api/") {
        endpoint.to_string()
    } else {
        format!("/api/{}", endpoint.trim_start_matches('/'))
    }
}

fn base_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

fn auth_headers(token: &str) -> Result<HeaderMap> {
    let mut headers = base_headers();
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ControlError::Authentication("token is not a valid header".to_string()))?;
    headers.insert(AUTHORIZATION, value);
    Ok(headers)
}

/// Decode a panel response into a JSON body or a classified error
async fn decode_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status().as_u16();
    let raw = response.text().await.unwrap_or_default();

    let data: Value = if raw.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(&raw)
            .unwrap_or_else(|_| serde_json::json!({"detail": "Invalid JSON response"}))
    };

    classify_response(status, data, raw)
}

fn classify_response(status: u16, data: Value, raw: String) -> Result<Value> {
    match status {
        200..=299 => Ok(data),
        401 => Err(ControlError::Authentication(detail_of(
            &data,
            "Authentication failed",
        ))),
        403 => Err(ControlError::Authorization(detail_of(
            &data,
            "Access forbidden",
        ))),
        404 => Err(ControlError::NotFound(detail_of(
            &data,
            "Resource not found",
        ))),
        409 => Err(ControlError::Validation(detail_of(
            &data,
            "Entity already exists",
        ))),
        422 => Err(ControlError::Validation(format_validation_detail(&data))),
        _ => Err(ControlError::Api {
            message: detail_of(&data, &format!("API error: {}", status)),
            status,
            body: raw,
        }),
    }
}

fn detail_of(data: &Value, fallback: &str) -> String {
    data.get("detail")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// 422 bodies carry a detail array; extract `loc -> loc: msg` pairs
fn format_validation_detail(data: &Value) -> String {
    match data.get("detail") {
        Some(Value::Array(items)) if !items.is_empty() => {
            let errors: Vec<String> = items
                .iter()
                .map(|item| {
                    let field = item
                        .get("loc")
                        .and_then(|loc| loc.as_array())
                        .map(|parts| {
                            parts
                                .iter()
                                .map(|p| match p {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                })
                                .collect::<Vec<_>>()
                                .join(" -> ")
                        })
                        .unwrap_or_default();
                    let msg = item
                        .get("msg")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Invalid value");
                    format!("{}: {}", field, msg)
                })
                .collect();
            errors.join("; ")
        }
        Some(Value::String(s)) => s.clone(),
        _ => "Validation error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_path() {
        assert_eq!(api_path("nodes"), "/api/nodes");
        assert_eq!(api_path("/nodes/7"), "/api/nodes/7");
        assert_eq!(api_path("/api/admin/token"), "/api/admin/token");
    }

    #[test]
    fn test_classify_success() {
        let body = serde_json::json!({"id": 1});
        let result = classify_response(200, body.clone(), String::new()).unwrap();
        assert_eq!(result, body);
    }

    #[test]
    fn test_classify_auth_errors() {
        let data = serde_json::json!({"detail": "token expired"});
        match classify_response(401, data, String::new()) {
            Err(ControlError::Authentication(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("unexpected: {:?}", other),
        }

        match classify_response(403, serde_json::json!({}), String::new()) {
            Err(ControlError::Authorization(msg)) => assert_eq!(msg, "Access forbidden"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_classify_conflict_and_not_found() {
        assert!(matches!(
            classify_response(404, serde_json::json!({}), String::new()),
            Err(ControlError::NotFound(_))
        ));
        match classify_response(409, serde_json::json!({}), String::new()) {
            Err(ControlError::Validation(msg)) => assert_eq!(msg, "Entity already exists"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_classify_422_field_paths() {
        let data = serde_json::json!({
            "detail": [
                {"loc": ["body", "name"], "msg": "field required"},
                {"loc": ["body", "port"], "msg": "value is not a valid integer"}
            ]
        });

        match classify_response(422, data, String::new()) {
            Err(ControlError::Validation(msg)) => {
                assert_eq!(
                    msg,
                    "body -> name: field required; body -> port: value is not a valid integer"
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_classify_other_status_keeps_body() {
        let raw = r#"{"detail": "teapot"}"#.to_string();
        let data: Value = serde_json::from_str(&raw).unwrap();
        match classify_response(418, data, raw.clone()) {
            Err(ControlError::Api {
                message,
                status,
                body,
            }) => {
                assert_eq!(message, "teapot");
                assert_eq!(status, 418);
                assert_eq!(body, raw);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
