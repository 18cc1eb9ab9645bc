//! Typed node operations over the panel API.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::PanelClient;
use crate::error::{ControlError, Result};
use crate::node::{Node, NodeCreate, NodeSettings, NodeStatus, NodeUpdate, NodeUsage};

/// Counts of nodes per panel status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub disconnected: usize,
    pub disabled: usize,
    pub error: usize,
}

/// Usage responses arrive either wrapped or as a bare array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UsageResponse {
    Wrapped { usages: Vec<NodeUsage> },
    Bare(Vec<NodeUsage>),
}

impl PanelClient {
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        debug!("Fetching all nodes");
        let response = self.get("nodes", Vec::new()).await?;
        let nodes: Vec<Node> = serde_json::from_value(response)?;
        debug!(count = nodes.len(), "Fetched nodes");
        Ok(nodes)
    }

    pub async fn get_node(&self, node_id: i64) -> Result<Node> {
        let response = self
            .get(&format!("nodes/{}", node_id), Vec::new())
            .await
            .map_err(|e| remap_not_found(e, node_id))?;
        Ok(serde_json::from_value(response)?)
    }

    /// Create a node.
    ///
    /// Duplicate names and addresses are rejected before any POST is
    /// issued; the panel's own conflict response is remapped as a second
    /// line of defence.
    pub async fn create_node(&self, create: NodeCreate) -> Result<Node> {
        create.validate()?;

        let nodes = self.list_nodes().await?;
        if nodes.iter().any(|n| n.name == create.name) {
            return Err(ControlError::NodeAlreadyExists(format!(
                "node with name '{}' already exists",
                create.name
            )));
        }
        if nodes.iter().any(|n| n.address == create.address) {
            return Err(ControlError::NodeAlreadyExists(format!(
                "node with address '{}' already exists",
                create.address
            )));
        }

        info!(name = %create.name, address = %create.address, "Creating node");
        let body = serde_json::to_value(&create)?;
        let response = self.post("nodes", Some(body)).await.map_err(|e| match e {
            ControlError::Validation(msg) if msg.to_lowercase().contains("already exists") => {
                ControlError::NodeAlreadyExists(msg)
            }
            other => other,
        })?;

        let node: Node = serde_json::from_value(response)?;
        info!(node_id = node.id, name = %node.name, "Node created");
        Ok(node)
    }

    pub async fn update_node(&self, node_id: i64, update: NodeUpdate) -> Result<Node> {
        update.validate()?;

        info!(node_id = node_id, "Updating node");
        let body = serde_json::to_value(&update)?;
        let response = self
            .put(&format!("nodes/{}", node_id), Some(body))
            .await
            .map_err(|e| remap_not_found(e, node_id))?;

        Ok(serde_json::from_value(response)?)
    }

    pub async fn delete_node(&self, node_id: i64) -> Result<()> {
        info!(node_id = node_id, "Deleting node");
        self.delete(&format!("nodes/{}", node_id))
            .await
            .map_err(|e| remap_not_found(e, node_id))?;
        info!(node_id = node_id, "Node deleted");
        Ok(())
    }

    pub async fn reconnect_node(&self, node_id: i64) -> Result<()> {
        info!(node_id = node_id, "Triggering node reconnect");
        self.post(&format!("nodes/{}/reconnect", node_id), None)
            .await
            .map_err(|e| remap_not_found(e, node_id))?;
        Ok(())
    }

    /// Usage counters for an ISO-8601 window
    pub async fn nodes_usage(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<NodeUsage>> {
        let mut params = Vec::new();
        if let Some(start) = start {
            params.push(("start".to_string(), start.to_rfc3339()));
        }
        if let Some(end) = end {
            params.push(("end".to_string(), end.to_rfc3339()));
        }

        let response = self.get("nodes/usage", params).await?;
        let usage: UsageResponse = serde_json::from_value(response)
            .map_err(|e| ControlError::Serialization(format!("unknown usage shape: {}", e)))?;

        Ok(match usage {
            UsageResponse::Wrapped { usages } => usages,
            UsageResponse::Bare(usages) => usages,
        })
    }

    pub async fn node_settings(&self) -> Result<NodeSettings> {
        let response = self.get("node/settings", Vec::new()).await?;
        Ok(serde_json::from_value(response)?)
    }

    pub async fn find_node_by_name(&self, name: &str) -> Result<Option<Node>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes.into_iter().find(|n| n.name == name))
    }

    pub async fn find_node_by_address(&self, address: &str) -> Result<Option<Node>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes.into_iter().find(|n| n.address == address))
    }

    pub async fn status_summary(&self) -> Result<StatusSummary> {
        let nodes = self.list_nodes().await?;
        Ok(summarize(&nodes))
    }

    pub async fn healthy_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes.into_iter().filter(|n| n.is_healthy()).collect())
    }

    pub async fn unhealthy_nodes(&self) -> Result<Vec<Node>> {
        let nodes = self.list_nodes().await?;
        Ok(nodes.into_iter().filter(|n| !n.is_healthy()).collect())
    }

    /// Re-enable a disabled node; the panel reports it as connecting
    pub async fn enable_node(&self, node_id: i64) -> Result<Node> {
        self.update_node(node_id, NodeUpdate::status(NodeStatus::Connecting))
            .await
    }

    pub async fn disable_node(&self, node_id: i64) -> Result<Node> {
        self.update_node(node_id, NodeUpdate::status(NodeStatus::Disabled))
            .await
    }

    /// Poll until the node reports connected.
    ///
    /// Returns `Ok(false)` when the node lands in the error state or the
    /// timeout passes; transient poll failures are logged and retried.
    pub async fn wait_for_node_connection(
        &self,
        node_id: i64,
        timeout: Duration,
        check_interval: Duration,
    ) -> Result<bool> {
        info!(
            node_id = node_id,
            timeout_secs = timeout.as_secs(),
            "Waiting for node connection"
        );
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            match self.get_node(node_id).await {
                Ok(node) => match node.status {
                    NodeStatus::Connected => {
                        info!(node_id = node_id, "Node connected");
                        return Ok(true);
                    }
                    NodeStatus::Error => {
                        warn!(node_id = node_id, "Node entered error state");
                        return Ok(false);
                    }
                    status => {
                        debug!(node_id = node_id, status = %status, "Node not connected yet");
                    }
                },
                Err(ControlError::NodeNotFound(_)) => {
                    return Err(ControlError::NodeNotFound(node_id))
                }
                Err(e) => {
                    warn!(node_id = node_id, error = %e, "Status poll failed");
                }
            }

            tokio::time::sleep(check_interval).await;
        }

        warn!(node_id = node_id, "Node connection wait timed out");
        Ok(false)
    }
}

fn remap_not_found(err: ControlError, node_id: i64) -> ControlError {
    match err {
        ControlError::NotFound(_) => ControlError::NodeNotFound(node_id),
        other => other,
    }
}

fn summarize(nodes: &[Node]) -> StatusSummary {
    let mut summary = StatusSummary {
        total: nodes.len(),
        ..StatusSummary::default()
    };

    for node in nodes {
        match node.status {
            NodeStatus::Connected => summary.connected += 1,
            NodeStatus::Connecting => summary.connecting += 1,
            NodeStatus::Disconnected => summary.disconnected += 1,
            NodeStatus::Disabled => summary.disabled += 1,
            NodeStatus::Error => summary.error += 1,
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, status: NodeStatus) -> Node {
        Node {
            id,
            name: format!("n{}", id),
            address: format!("10.0.0.{}", id),
            port: 62050,
            api_port: 62051,
            usage_coefficient: 1.0,
            status,
            xray_version: None,
            message: None,
        }
    }

    #[test]
    fn test_summarize() {
        let nodes = vec![
            node(1, NodeStatus::Connected),
            node(2, NodeStatus::Connected),
            node(3, NodeStatus::Disconnected),
            node(4, NodeStatus::Disabled),
            node(5, NodeStatus::Error),
        ];

        let summary = summarize(&nodes);
        assert_eq!(summary.total, 5);
        assert_eq!(summary.connected, 2);
        assert_eq!(summary.disconnected, 1);
        assert_eq!(summary.disabled, 1);
        assert_eq!(summary.error, 1);
        assert_eq!(summary.connecting, 0);
    }

    #[test]
    fn test_usage_response_shapes() {
        let bare = serde_json::json!([
            {"node_id": 1, "node_name": "n1", "uplink": 10, "downlink": 20}
        ]);
        let wrapped = serde_json::json!({
            "usages": [
                {"node_id": 1, "node_name": "n1", "uplink": 10, "downlink": 20}
            ]
        });

        let from_bare: UsageResponse = serde_json::from_value(bare).unwrap();
        let from_wrapped: UsageResponse = serde_json::from_value(wrapped).unwrap();

        for shape in [from_bare, from_wrapped] {
            let usages = match shape {
                UsageResponse::Wrapped { usages } => usages,
                UsageResponse::Bare(usages) => usages,
            };
            assert_eq!(usages.len(), 1);
            assert_eq!(usages[0].total(), 30);
        }
    }

    #[test]
    fn test_unknown_usage_shape_fails_loudly() {
        let bogus = serde_json::json!({"totals": []});
        assert!(serde_json::from_value::<UsageResponse>(bogus).is_err());
    }

    #[test]
    fn test_remap_not_found() {
        let err = remap_not_found(ControlError::NotFound("gone".into()), 7);
        assert!(matches!(err, ControlError::NodeNotFound(7)));

        let err = remap_not_found(ControlError::Validation("bad".into()), 7);
        assert!(matches!(err, ControlError::Validation(_)));
    }
}
