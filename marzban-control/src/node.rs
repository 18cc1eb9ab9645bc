use std::net::Ipv4Addr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Node status as reported by the panel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Connected,
    Connecting,
    Disconnected,
    Disabled,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Connected => "connected",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Disconnected => "disconnected",
            NodeStatus::Disabled => "disabled",
            NodeStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proxy node record owned by the panel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    /// Panel-assigned identifier
    pub id: i64,
    pub name: String,
    /// IPv4 address of the host
    pub address: String,
    pub port: u16,
    pub api_port: u16,
    pub usage_coefficient: f64,
    #[serde(default = "default_status")]
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xray_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_status() -> NodeStatus {
    NodeStatus::Disconnected
}

impl Node {
    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Connected
    }
}

/// Payload for creating a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCreate {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub api_port: u16,
    pub usage_coefficient: f64,
    pub add_as_new_host: bool,
}

impl Default for NodeCreate {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: String::new(),
            port: 62050,
            api_port: 62051,
            usage_coefficient: 1.0,
            add_as_new_host: true,
        }
    }
}

impl NodeCreate {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !validate_node_name(&self.name) {
            return Err(ControlError::Node(format!(
                "invalid node name: '{}'",
                self.name
            )));
        }
        if !is_valid_ip(&self.address) {
            return Err(ControlError::Node(format!(
                "invalid IP address: '{}'",
                self.address
            )));
        }
        if !is_valid_port(self.port) {
            return Err(ControlError::Node(format!("invalid port: {}", self.port)));
        }
        if !is_valid_port(self.api_port) {
            return Err(ControlError::Node(format!(
                "invalid API port: {}",
                self.api_port
            )));
        }
        if self.usage_coefficient <= 0.0 {
            return Err(ControlError::Node(
                "usage coefficient must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Partial update payload; only present fields are validated and sent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_coefficient: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

impl NodeUpdate {
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.name {
            if !validate_node_name(name) {
                return Err(ControlError::Node(format!("invalid node name: '{}'", name)));
            }
        }
        if let Some(address) = &self.address {
            if !is_valid_ip(address) {
                return Err(ControlError::Node(format!(
                    "invalid IP address: '{}'",
                    address
                )));
            }
        }
        if let Some(port) = self.port {
            if !is_valid_port(port) {
                return Err(ControlError::Node(format!("invalid port: {}", port)));
            }
        }
        if let Some(api_port) = self.api_port {
            if !is_valid_port(api_port) {
                return Err(ControlError::Node(format!(
                    "invalid API port: {}",
                    api_port
                )));
            }
        }
        if let Some(coefficient) = self.usage_coefficient {
            if coefficient <= 0.0 {
                return Err(ControlError::Node(
                    "usage coefficient must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Per-node traffic counters for a usage window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeUsage {
    pub node_id: i64,
    pub node_name: String,
    pub uplink: u64,
    pub downlink: u64,
}

impl NodeUsage {
    pub fn total(&self) -> u64 {
        self.uplink + self.downlink
    }

    pub fn formatted_uplink(&self) -> String {
        format_bytes(self.uplink)
    }

    pub fn formatted_downlink(&self) -> String {
        format_bytes(self.downlink)
    }

    pub fn formatted_total(&self) -> String {
        format_bytes(self.total())
    }
}

/// Fleet-wide node settings returned by the panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    #[serde(default)]
    pub min_node_version: String,
    /// PEM certificate nodes present to the panel
    #[serde(default)]
    pub certificate: String,
}

/// Check that a string parses as an IPv4 address
pub fn is_valid_ip(ip: &str) -> bool {
    ip.parse::<Ipv4Addr>().is_ok()
}

/// Ports are valid in 1..=65535
pub fn is_valid_port(port: u16) -> bool {
    port != 0
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z0-9 _-]+$").expect("static regex"))
}

/// Node names: 2..=50 characters of alphanumerics, space, hyphen, underscore
pub fn validate_node_name(name: &str) -> bool {
    let len = name.chars().count();
    (2..=50).contains(&len) && name_regex().is_match(name)
}

/// Parse a version string into (major, minor, patch); missing or bad
/// segments become 0
pub fn parse_version(version: &str) -> (u32, u32, u32) {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');

    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .unwrap_or(0)
    };

    (next(), next(), next())
}

/// True when `version` is at least `minimum` (semantic ordering)
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    parse_version(version) >= parse_version(minimum)
}

impl Node {
    /// Whether this node's reported xray version satisfies the panel's
    /// minimum; nodes that report nothing do not satisfy any minimum
    pub fn meets_min_version(&self, minimum: &str) -> bool {
        if minimum.is_empty() {
            return true;
        }
        self.xray_version
            .as_deref()
            .map(|v| version_at_least(v, minimum))
            .unwrap_or(false)
    }
}

/// Format a byte count with 1024-based units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}
