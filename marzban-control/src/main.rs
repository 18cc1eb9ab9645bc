use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use marzban_control::config::AppConfig;
use marzban_control::core::Core;
use marzban_control::security::SecretsVault;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marzban_control=info".into()),
        )
        .with_target(false)
        .with_line_number(true)
        .init();

    info!(
        "Starting Marzban control plane v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/settings.toml"));

    let vault = SecretsVault::open(SecretsVault::default_dir())
        .context("Failed to initialize secrets vault")?;

    if !config_path.exists() {
        AppConfig::default()
            .save_secure(&config_path, &vault)
            .context("Failed to write configuration template")?;
        warn!(
            path = %config_path.display(),
            "Wrote a configuration template; set marzban.base_url, username and password, then restart"
        );
        return Ok(());
    }

    let config = AppConfig::load_secure(&config_path, &vault)
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Persist back through the vault so plaintext secrets get sealed
    config
        .save_secure(&config_path, &vault)
        .context("Failed to re-seal configuration")?;

    if config.metrics.enabled {
        let addr: std::net::SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .context("Invalid metrics.listen_addr")?;

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(metrics_addr = %addr, "Prometheus metrics server started");
    }

    let core = Core::init(config).await.context("Core startup failed")?;

    core.monitoring.start();
    info!("Monitoring started, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    core.close().await;

    Ok(())
}
