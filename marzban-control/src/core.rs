use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::api::PanelClient;
use crate::bulk::BulkRunner;
use crate::cache::{CacheConfig, CacheStore};
use crate::config::AppConfig;
use crate::discovery::DiscoveryEngine;
use crate::error::{ControlError, Result};
use crate::monitor::{MonitorConfig, MonitoringEngine};
use crate::node::{NodeCreate, NodeUpdate};
use crate::offline::{OfflineQueue, OperationType, QueueConfig, QueuedOperation, SyncHandler};
use crate::pool::ConnectionManager;
use crate::token::TokenStore;

/// Composition root holding every subsystem.
///
/// Subsystems are plain values wired together here instead of process
/// globals; the lifecycle is `init` → use → `close`.
pub struct Core {
    pub config: AppConfig,
    pub tokens: Arc<TokenStore>,
    pub connections: Arc<ConnectionManager>,
    pub cache: Arc<CacheStore>,
    pub offline: Arc<OfflineQueue>,
    pub panel: Arc<PanelClient>,
    pub monitoring: MonitoringEngine,
    pub discovery: Arc<DiscoveryEngine>,
    pub bulk: BulkRunner,
}

impl Core {
    /// Build and wire every subsystem
    pub async fn init(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let tokens = Arc::new(TokenStore::new());
        let connections = Arc::new(ConnectionManager::new());

        let cache_dir = PathBuf::from(&config.cache.directory);
        let cache = Arc::new(CacheStore::open(CacheConfig {
            db_path: cache_dir.join("cache.db"),
            max_size_bytes: config.cache.max_size_mb * 1024 * 1024,
            ..CacheConfig::default()
        })?);

        let offline = Arc::new(OfflineQueue::open(QueueConfig {
            db_path: cache_dir.join("offline.db"),
            ..QueueConfig::default()
        })?);

        let panel = Arc::new(PanelClient::new(
            config.marzban.clone(),
            config.retry_config(),
            config.breaker_config(),
            Arc::clone(&connections),
            Arc::clone(&tokens),
        )?);

        offline
            .register_sync_handler(
                "node",
                Arc::new(NodeSyncHandler {
                    client: Arc::clone(&panel),
                }),
            )
            .await;

        let monitoring = MonitoringEngine::new(
            Arc::clone(&panel),
            Arc::clone(&cache),
            MonitorConfig {
                interval: config.monitoring_interval(),
                history_size: config.monitoring.history_size,
                ..MonitorConfig::default()
            },
        );

        let discovery = Arc::new(DiscoveryEngine::new()?);
        let bulk = BulkRunner::new(Arc::clone(&panel), Some(Arc::clone(&offline)));

        info!("Core initialized");
        Ok(Self {
            config,
            tokens,
            connections,
            cache,
            offline,
            panel,
            monitoring,
            discovery,
            bulk,
        })
    }

    /// Stop every subsystem in dependency order
    pub async fn close(&self) {
        self.monitoring.stop().await;
        self.discovery.stop_discovery();
        self.tokens.cleanup().await;
        self.connections.close_all_pools();
        self.offline.close().await;
        self.cache.close().await;
        info!("Core shut down");
    }
}

/// Replays queued node writes against the panel
struct NodeSyncHandler {
    client: Arc<PanelClient>,
}

#[async_trait]
impl SyncHandler for NodeSyncHandler {
    async fn sync(&self, operation: &QueuedOperation) -> Result<()> {
        debug!(
            id = %operation.id,
            operation = operation.operation_type.as_str(),
            "Replaying queued node operation"
        );

        match operation.operation_type {
            OperationType::Create | OperationType::BulkCreate => {
                let create: NodeCreate = serde_json::from_value(operation.data.clone())?;
                match self.client.create_node(create).await {
                    Ok(_) => Ok(()),
                    // A replay after a raced earlier success is a no-op
                    Err(ControlError::NodeAlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            OperationType::Update | OperationType::BulkUpdate => {
                let node_id = operation_node_id(operation)?;
                let patch: NodeUpdate = serde_json::from_value(
                    operation
                        .data
                        .get("patch")
                        .cloned()
                        .unwrap_or(operation.data.clone()),
                )?;
                self.client.update_node(node_id, patch).await?;
                Ok(())
            }
            OperationType::Delete | OperationType::BulkDelete => {
                let node_id = operation_node_id(operation)?;
                match self.client.delete_node(node_id).await {
                    Ok(()) => Ok(()),
                    // Already gone
                    Err(ControlError::NodeNotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

fn operation_node_id(operation: &QueuedOperation) -> Result<i64> {
    operation
        .data
        .get("node_id")
        .and_then(|v| v.as_i64())
        .or_else(|| {
            operation
                .resource_id
                .as_deref()
                .and_then(|id| id.parse().ok())
        })
        .ok_or_else(|| {
            ControlError::Node(format!("queued operation {} has no node id", operation.id))
        })
}
