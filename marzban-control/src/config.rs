use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::breaker::CircuitBreakerConfig;
use crate::error::{ControlError, Result};
use crate::retry::RetryConfig;
use crate::security::SecretsVault;

/// Main configuration for the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Enable debug behavior
    pub debug: bool,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Optional log file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    /// Panel connection settings
    pub marzban: MarzbanConfig,
    /// Telegram notification settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramConfig>,
    /// Monitoring engine settings
    pub monitoring: MonitoringSection,
    /// API client retry settings
    pub api: ApiSection,
    /// Metrics exporter settings
    pub metrics: MetricsSection,
    /// Local cache and offline store settings
    pub cache: CacheSection,
}

/// Marzban panel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarzbanConfig {
    /// Panel base URL, e.g. https://panel.example.com
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Verify TLS certificates
    pub verify_ssl: bool,
}

/// Telegram notification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSection {
    /// Seconds between health ticks (minimum 10)
    pub health_check_interval: u64,
    /// Metrics samples retained per node
    pub history_size: usize,
}

/// API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub retry_attempts: u32,
    /// Base retry delay in seconds
    pub retry_delay: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

/// Metrics exporter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub listen_addr: String,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Directory holding cache.db and offline.db
    pub directory: String,
    /// Cache byte budget in megabytes
    pub max_size_mb: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            log_file: None,
            marzban: MarzbanConfig::default(),
            telegram: None,
            monitoring: MonitoringSection::default(),
            api: ApiSection::default(),
            metrics: MetricsSection::default(),
            cache: CacheSection::default(),
        }
    }
}

impl Default for MarzbanConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            timeout_seconds: 30,
            verify_ssl: true,
        }
    }
}

impl Default for MonitoringSection {
    fn default() -> Self {
        Self {
            health_check_interval: 30,
            history_size: 100,
        }
    }
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: 2,
            secret_key: None,
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            directory: "cache".to_string(),
            max_size_mb: 100,
        }
    }
}

impl MarzbanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }
}

impl AppConfig {
    /// Load configuration from a plaintext file plus MARZBAN_* environment
    pub fn from_file(path: &str) -> std::result::Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MARZBAN"))
            .build()?;

        settings.try_deserialize()
    }

    /// Load configuration, decrypting `encrypted:` fields through the vault
    pub fn load_secure(path: impl AsRef<Path>, vault: &SecretsVault) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let doc: serde_json::Value = toml::from_str(&raw)
            .map_err(|e| ControlError::Configuration(format!("invalid config file: {}", e)))?;

        let unsealed = vault.unseal_document(&doc);
        let config: AppConfig = serde_json::from_value(unsealed)
            .map_err(|e| ControlError::Configuration(format!("invalid config shape: {}", e)))?;

        Ok(config)
    }

    /// Save configuration, encrypting sensitive fields through the vault
    pub fn save_secure(&self, path: impl AsRef<Path>, vault: &SecretsVault) -> Result<()> {
        let doc = serde_json::to_value(self)?;
        let sealed = vault.seal_document(&doc)?;

        let toml_string = toml::to_string_pretty(&sealed)
            .map_err(|e| ControlError::Serialization(e.to_string()))?;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, toml_string)?;
        set_config_mode(path)?;

        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.marzban.base_url.is_empty() {
            return Err(ControlError::Configuration(
                "marzban.base_url is required".to_string(),
            ));
        }
        if !self.marzban.base_url.starts_with("http://")
            && !self.marzban.base_url.starts_with("https://")
        {
            return Err(ControlError::Configuration(format!(
                "marzban.base_url must be an http(s) URL, got '{}'",
                self.marzban.base_url
            )));
        }
        if self.marzban.username.is_empty() || self.marzban.password.is_empty() {
            return Err(ControlError::Configuration(
                "marzban credentials are required".to_string(),
            ));
        }
        if self.marzban.timeout_seconds == 0 {
            return Err(ControlError::Configuration(
                "marzban.timeout_seconds cannot be 0".to_string(),
            ));
        }
        if self.monitoring.health_check_interval == 0 {
            return Err(ControlError::Configuration(
                "monitoring.health_check_interval cannot be 0".to_string(),
            ));
        }
        if self.cache.max_size_mb == 0 {
            return Err(ControlError::Configuration(
                "cache.max_size_mb cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry policy derived from the api section
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.api.retry_attempts.max(1),
            base_delay: Duration::from_secs(self.api.retry_delay),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
    }

    /// Monitoring interval with the 10-second floor applied
    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring.health_check_interval.max(10))
    }
}

#[cfg(unix)]
fn set_config_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_config_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn configured() -> AppConfig {
        let mut config = AppConfig::default();
        config.marzban.base_url = "https://panel.example.com".to_string();
        config.marzban.username = "admin".to_string();
        config.marzban.password = "hunter2".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.marzban.timeout_seconds, 30);
        assert!(config.marzban.verify_ssl);
        assert_eq!(config.monitoring.health_check_interval, 30);
        assert_eq!(config.monitoring.history_size, 100);
        assert_eq!(config.api.retry_attempts, 3);
        assert_eq!(config.cache.max_size_mb, 100);
        assert!(!config.marzban.is_configured());
    }

    #[test]
    fn test_validation() {
        let mut config = configured();
        assert!(config.validate().is_ok());

        config.marzban.base_url = "panel.example.com".to_string();
        assert!(config.validate().is_err());

        config.marzban.base_url = String::new();
        assert!(config.validate().is_err());

        let mut config = configured();
        config.marzban.password = String::new();
        assert!(config.validate().is_err());

        let mut config = configured();
        config.cache.max_size_mb = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_monitoring_interval_floor() {
        let mut config = configured();
        config.monitoring.health_check_interval = 3;
        assert_eq!(config.monitoring_interval(), Duration::from_secs(10));

        config.monitoring.health_check_interval = 45;
        assert_eq!(config.monitoring_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_secure_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let vault = SecretsVault::open(dir.path().join("vault")).unwrap();
        let path = dir.path().join("settings.toml");

        let mut config = configured();
        config.telegram = Some(TelegramConfig {
            bot_token: Some("123:abc".to_string()),
            chat_id: Some("-100".to_string()),
        });

        config.save_secure(&path, &vault).unwrap();

        // Password is not stored in clear text
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(!raw.contains("123:abc"));
        assert!(raw.contains("encrypted:"));

        let loaded = AppConfig::load_secure(&path, &vault).unwrap();
        assert_eq!(loaded.marzban.password, "hunter2");
        assert_eq!(
            loaded.telegram.as_ref().unwrap().bot_token.as_deref(),
            Some("123:abc")
        );
        assert_eq!(loaded.marzban.base_url, config.marzban.base_url);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_config_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let vault = SecretsVault::open(dir.path().join("vault")).unwrap();
        let path = dir.path().join("settings.toml");

        configured().save_secure(&path, &vault).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_retry_config_derivation() {
        let mut config = configured();
        config.api.retry_attempts = 0;
        let retry = config.retry_config();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.base_delay, Duration::from_secs(2));
    }
}
