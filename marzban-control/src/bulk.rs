use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::api::PanelClient;
use crate::error::ControlError;
use crate::node::{NodeCreate, NodeStatus, NodeUpdate};
use crate::offline::{OfflineQueue, OperationType};

/// Pause between items to avoid overwhelming the panel
const ITEM_PAUSE: Duration = Duration::from_millis(100);
/// Reconnects are heavier on the panel side
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// Overall status of a bulk run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

/// Outcome of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failed,
    /// Panel unreachable; the write was placed on the offline queue
    Queued,
}

/// Per-item detail recorded in the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemDetail {
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a bulk operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkReport {
    pub operation_id: Uuid,
    pub operation_type: String,
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    pub status: BulkStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub details: HashMap<String, BulkItemDetail>,
}

impl BulkReport {
    fn new(operation_type: &str, total_items: usize) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            operation_type: operation_type.to_string(),
            total_items,
            successful_items: 0,
            failed_items: 0,
            status: BulkStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            errors: Vec::new(),
            details: HashMap::new(),
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        self.successful_items as f64 / self.total_items as f64 * 100.0
    }

    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or(Duration::ZERO)
    }

    fn finish(&mut self) {
        self.end_time = Some(Utc::now());
        self.status = classify_outcome(self.successful_items, self.failed_items);
    }

    fn fail_run(&mut self, message: String) {
        self.errors.push(message);
        self.end_time = Some(Utc::now());
        self.status = BulkStatus::Failed;
    }
}

fn classify_outcome(successful: usize, failed: usize) -> BulkStatus {
    if failed == 0 {
        BulkStatus::Completed
    } else if successful == 0 {
        BulkStatus::Failed
    } else {
        BulkStatus::Partial
    }
}

/// Reusable defaults merged into bulk-create items
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub name: String,
    pub description: String,
    pub port: u16,
    pub api_port: u16,
    pub usage_coefficient: f64,
    pub add_as_new_host: bool,
    pub tags: Vec<String>,
}

/// One create item; absent fields fall back to the template, then defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCreateItem {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_coefficient: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub add_as_new_host: Option<bool>,
}

impl BulkCreateItem {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port: None,
            api_port: None,
            usage_coefficient: None,
            add_as_new_host: None,
        }
    }

    /// Item fields win over template fields, which win over defaults
    fn into_create(self, template: Option<&NodeTemplate>) -> NodeCreate {
        let defaults = NodeCreate::default();
        NodeCreate {
            name: self.name,
            address: self.address,
            port: self
                .port
                .or(template.map(|t| t.port))
                .unwrap_or(defaults.port),
            api_port: self
                .api_port
                .or(template.map(|t| t.api_port))
                .unwrap_or(defaults.api_port),
            usage_coefficient: self
                .usage_coefficient
                .or(template.map(|t| t.usage_coefficient))
                .unwrap_or(defaults.usage_coefficient),
            add_as_new_host: self
                .add_as_new_host
                .or(template.map(|t| t.add_as_new_host))
                .unwrap_or(defaults.add_as_new_host),
        }
    }
}

/// Progress report emitted between items
#[derive(Debug, Clone)]
pub struct BulkProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

type Progress = Option<mpsc::Sender<BulkProgress>>;

/// Serial-with-pacing orchestrator for fleet-wide node operations.
///
/// When the panel is unreachable and an offline queue is attached, write
/// items are queued for replay and reported as accepted.
pub struct BulkRunner {
    client: Arc<PanelClient>,
    queue: Option<Arc<OfflineQueue>>,
    operations: DashMap<Uuid, BulkReport>,
    templates: RwLock<HashMap<String, NodeTemplate>>,
}

impl BulkRunner {
    pub fn new(client: Arc<PanelClient>, queue: Option<Arc<OfflineQueue>>) -> Self {
        let runner = Self {
            client,
            queue,
            operations: DashMap::new(),
            templates: RwLock::new(HashMap::new()),
        };
        runner.load_default_templates();
        runner
    }

    fn load_default_templates(&self) {
        let defaults = [
            (
                "standard",
                NodeTemplate {
                    name: "Standard Node".to_string(),
                    description: "Standard configuration for most nodes".to_string(),
                    port: 62050,
                    api_port: 62051,
                    usage_coefficient: 1.0,
                    add_as_new_host: true,
                    tags: vec!["standard".to_string()],
                },
            ),
            (
                "high_performance",
                NodeTemplate {
                    name: "High Performance Node".to_string(),
                    description: "Optimized for high traffic".to_string(),
                    port: 62050,
                    api_port: 62051,
                    usage_coefficient: 1.5,
                    add_as_new_host: true,
                    tags: vec!["high-performance".to_string(), "premium".to_string()],
                },
            ),
            (
                "backup",
                NodeTemplate {
                    name: "Backup Node".to_string(),
                    description: "Backup node configuration".to_string(),
                    port: 62052,
                    api_port: 62053,
                    usage_coefficient: 0.5,
                    add_as_new_host: true,
                    tags: vec!["backup".to_string(), "secondary".to_string()],
                },
            ),
            (
                "development",
                NodeTemplate {
                    name: "Development Node".to_string(),
                    description: "For development and testing".to_string(),
                    port: 62054,
                    api_port: 62055,
                    usage_coefficient: 0.1,
                    add_as_new_host: true,
                    tags: vec!["development".to_string(), "testing".to_string()],
                },
            ),
        ];

        let mut templates = self.templates.write().expect("templates lock poisoned");
        for (key, template) in defaults {
            templates.insert(key.to_string(), template);
        }
    }

    pub fn template(&self, name: &str) -> Option<NodeTemplate> {
        self.templates
            .read()
            .expect("templates lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn set_template(&self, name: &str, template: NodeTemplate) {
        self.templates
            .write()
            .expect("templates lock poisoned")
            .insert(name.to_string(), template);
    }

    pub fn remove_template(&self, name: &str) -> bool {
        self.templates
            .write()
            .expect("templates lock poisoned")
            .remove(name)
            .is_some()
    }

    pub fn list_templates(&self) -> Vec<String> {
        self.templates
            .read()
            .expect("templates lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn operation_result(&self, id: Uuid) -> Option<BulkReport> {
        self.operations.get(&id).map(|e| e.value().clone())
    }

    pub fn active_operations(&self) -> Vec<BulkReport> {
        self.operations.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop finished reports from memory; returns removed count
    pub fn clear_finished(&self) -> usize {
        let finished: Vec<Uuid> = self
            .operations
            .iter()
            .filter(|e| e.value().status != BulkStatus::Running)
            .map(|e| *e.key())
            .collect();

        for id in &finished {
            self.operations.remove(id);
        }
        finished.len()
    }

    /// Create many nodes, optionally merging a named template
    pub async fn bulk_create(
        &self,
        items: Vec<BulkCreateItem>,
        template_name: Option<&str>,
        progress: Progress,
    ) -> BulkReport {
        let mut report = BulkReport::new("bulk_create", items.len());
        info!(operation_id = %report.operation_id, items = items.len(), "Starting bulk create");

        let template = match template_name {
            Some(name) => match self.template(name) {
                Some(template) => Some(template),
                None => {
                    report.fail_run(format!("unknown template '{}'", name));
                    error!(template = name, "Bulk create aborted: unknown template");
                    self.operations.insert(report.operation_id, report.clone());
                    return report;
                }
            },
            None => None,
        };

        self.operations.insert(report.operation_id, report.clone());

        for (index, item) in items.into_iter().enumerate() {
            send_progress(
                &progress,
                index,
                report.total_items,
                format!("Creating node: {}", item.name),
            )
            .await;

            let key = format!("node_{}", index);
            let create = item.into_create(template.as_ref());

            match self.client.create_node(create.clone()).await {
                Ok(node) => {
                    report.successful_items += 1;
                    report.details.insert(
                        key,
                        BulkItemDetail {
                            status: ItemStatus::Success,
                            node_id: Some(node.id),
                            name: Some(node.name),
                            error: None,
                        },
                    );
                }
                Err(e) if e.is_connection_error() && self.queue.is_some() => {
                    self.queue_write(
                        &mut report,
                        key,
                        OperationType::Create,
                        serde_json::to_value(&create).unwrap_or_default(),
                        None,
                        Some(create.name.clone()),
                        &e,
                    )
                    .await;
                }
                Err(e) => {
                    record_failure(&mut report, key, None, Some(create.name.clone()), e);
                }
            }

            tokio::time::sleep(ITEM_PAUSE).await;
        }

        self.finish(report, progress).await
    }

    /// Apply one patch to many nodes
    pub async fn bulk_update(
        &self,
        node_ids: Vec<i64>,
        patch: NodeUpdate,
        progress: Progress,
    ) -> BulkReport {
        let mut report = BulkReport::new("bulk_update", node_ids.len());
        info!(operation_id = %report.operation_id, items = node_ids.len(), "Starting bulk update");
        self.operations.insert(report.operation_id, report.clone());

        for (index, node_id) in node_ids.into_iter().enumerate() {
            send_progress(
                &progress,
                index,
                report.total_items,
                format!("Updating node: {}", node_id),
            )
            .await;

            let key = format!("node_{}", node_id);
            match self.client.update_node(node_id, patch.clone()).await {
                Ok(node) => {
                    report.successful_items += 1;
                    report.details.insert(
                        key,
                        BulkItemDetail {
                            status: ItemStatus::Success,
                            node_id: Some(node.id),
                            name: Some(node.name),
                            error: None,
                        },
                    );
                }
                Err(e) if e.is_connection_error() && self.queue.is_some() => {
                    let data = serde_json::json!({
                        "node_id": node_id,
                        "patch": serde_json::to_value(&patch).unwrap_or_default(),
                    });
                    self.queue_write(
                        &mut report,
                        key,
                        OperationType::Update,
                        data,
                        Some(node_id.to_string()),
                        None,
                        &e,
                    )
                    .await;
                }
                Err(e) => {
                    record_failure(&mut report, key, Some(node_id), None, e);
                }
            }

            tokio::time::sleep(ITEM_PAUSE).await;
        }

        self.finish(report, progress).await
    }

    pub async fn bulk_delete(&self, node_ids: Vec<i64>, progress: Progress) -> BulkReport {
        let mut report = BulkReport::new("bulk_delete", node_ids.len());
        info!(operation_id = %report.operation_id, items = node_ids.len(), "Starting bulk delete");
        self.operations.insert(report.operation_id, report.clone());

        for (index, node_id) in node_ids.into_iter().enumerate() {
            send_progress(
                &progress,
                index,
                report.total_items,
                format!("Deleting node: {}", node_id),
            )
            .await;

            let key = format!("node_{}", node_id);
            match self.client.delete_node(node_id).await {
                Ok(()) => {
                    report.successful_items += 1;
                    report.details.insert(
                        key,
                        BulkItemDetail {
                            status: ItemStatus::Success,
                            node_id: Some(node_id),
                            name: None,
                            error: None,
                        },
                    );
                }
                Err(e) if e.is_connection_error() && self.queue.is_some() => {
                    let data = serde_json::json!({"node_id": node_id});
                    self.queue_write(
                        &mut report,
                        key,
                        OperationType::Delete,
                        data,
                        Some(node_id.to_string()),
                        None,
                        &e,
                    )
                    .await;
                }
                Err(e) => {
                    record_failure(&mut report, key, Some(node_id), None, e);
                }
            }

            tokio::time::sleep(ITEM_PAUSE).await;
        }

        self.finish(report, progress).await
    }

    pub async fn bulk_reconnect(&self, node_ids: Vec<i64>, progress: Progress) -> BulkReport {
        let mut report = BulkReport::new("bulk_reconnect", node_ids.len());
        info!(operation_id = %report.operation_id, items = node_ids.len(), "Starting bulk reconnect");
        self.operations.insert(report.operation_id, report.clone());

        for (index, node_id) in node_ids.into_iter().enumerate() {
            send_progress(
                &progress,
                index,
                report.total_items,
                format!("Reconnecting node: {}", node_id),
            )
            .await;

            let key = format!("node_{}", node_id);
            match self.client.reconnect_node(node_id).await {
                Ok(()) => {
                    report.successful_items += 1;
                    report.details.insert(
                        key,
                        BulkItemDetail {
                            status: ItemStatus::Success,
                            node_id: Some(node_id),
                            name: None,
                            error: None,
                        },
                    );
                }
                Err(e) => {
                    record_failure(&mut report, key, Some(node_id), None, e);
                }
            }

            tokio::time::sleep(RECONNECT_PAUSE).await;
        }

        self.finish(report, progress).await
    }

    /// Flip many nodes to a status; disabled and connected map to the
    /// panel's disable/enable semantics
    pub async fn bulk_change_status(
        &self,
        node_ids: Vec<i64>,
        new_status: NodeStatus,
        progress: Progress,
    ) -> BulkReport {
        let mut report = BulkReport::new("bulk_status_change", node_ids.len());
        info!(
            operation_id = %report.operation_id,
            items = node_ids.len(),
            status = %new_status,
            "Starting bulk status change"
        );
        self.operations.insert(report.operation_id, report.clone());

        for (index, node_id) in node_ids.into_iter().enumerate() {
            send_progress(
                &progress,
                index,
                report.total_items,
                format!("Changing status of node: {}", node_id),
            )
            .await;

            let key = format!("node_{}", node_id);
            let result = match new_status {
                NodeStatus::Disabled => self.client.disable_node(node_id).await,
                NodeStatus::Connected => self.client.enable_node(node_id).await,
                other => {
                    self.client
                        .update_node(node_id, NodeUpdate::status(other))
                        .await
                }
            };

            match result {
                Ok(node) => {
                    report.successful_items += 1;
                    report.details.insert(
                        key,
                        BulkItemDetail {
                            status: ItemStatus::Success,
                            node_id: Some(node.id),
                            name: Some(node.name),
                            error: None,
                        },
                    );
                }
                Err(e) if e.is_connection_error() && self.queue.is_some() => {
                    let data = serde_json::json!({
                        "node_id": node_id,
                        "patch": serde_json::to_value(NodeUpdate::status(new_status))
                            .unwrap_or_default(),
                    });
                    self.queue_write(
                        &mut report,
                        key,
                        OperationType::Update,
                        data,
                        Some(node_id.to_string()),
                        None,
                        &e,
                    )
                    .await;
                }
                Err(e) => {
                    record_failure(&mut report, key, Some(node_id), None, e);
                }
            }

            tokio::time::sleep(ITEM_PAUSE).await;
        }

        self.finish(report, progress).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn queue_write(
        &self,
        report: &mut BulkReport,
        key: String,
        operation_type: OperationType,
        data: serde_json::Value,
        resource_id: Option<String>,
        name: Option<String>,
        cause: &ControlError,
    ) {
        let queue = match self.queue.as_ref() {
            Some(queue) => queue,
            None => {
                record_failure(report, key, None, name, ControlError::Other(cause.to_string()));
                return;
            }
        };
        match queue
            .queue_operation(operation_type, "node", data, resource_id)
            .await
        {
            Ok(queued_id) => {
                debug!(queued_id = %queued_id, cause = %cause, "Panel unreachable, write queued");
                report.successful_items += 1;
                report.details.insert(
                    key,
                    BulkItemDetail {
                        status: ItemStatus::Queued,
                        node_id: None,
                        name,
                        error: None,
                    },
                );
            }
            Err(e) => {
                record_failure(report, key, None, name, e);
            }
        }
    }

    async fn finish(&self, mut report: BulkReport, progress: Progress) -> BulkReport {
        report.finish();
        send_progress(
            &progress,
            report.total_items,
            report.total_items,
            format!("{} completed", report.operation_type),
        )
        .await;

        info!(
            operation_id = %report.operation_id,
            successful = report.successful_items,
            failed = report.failed_items,
            status = ?report.status,
            "Bulk operation finished"
        );

        self.operations.insert(report.operation_id, report.clone());
        report
    }
}

fn record_failure(
    report: &mut BulkReport,
    key: String,
    node_id: Option<i64>,
    name: Option<String>,
    error: ControlError,
) {
    let message = match node_id {
        Some(id) => format!("node {}: {}", id, error),
        None => format!(
            "node {}: {}",
            name.as_deref().unwrap_or("unknown"),
            error
        ),
    };
    error!(error = %message, "Bulk item failed");

    report.failed_items += 1;
    report.errors.push(message);
    report.details.insert(
        key,
        BulkItemDetail {
            status: ItemStatus::Failed,
            node_id,
            name,
            error: Some(error.to_string()),
        },
    );
}

async fn send_progress(progress: &Progress, current: usize, total: usize, message: String) {
    if let Some(sender) = progress {
        let _ = sender
            .send(BulkProgress {
                current,
                total,
                message,
            })
            .await;
    }
}
