use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::PanelClient;
use crate::cache::CacheStore;
use crate::error::Result;
use crate::node::{Node, NodeStatus};

/// TTL for cached monitoring snapshots
const METRICS_CACHE_TTL: Duration = Duration::from_secs(60);

/// Pause after a failed tick before retrying
const TICK_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Node health buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

/// Point-in-time health sample for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: i64,
    pub node_name: String,
    pub status: NodeStatus,
    pub response_time_ms: Option<f64>,
    pub health: HealthStatus,
    pub last_seen: DateTime<Utc>,
}

/// Aggregate fleet health, recomputed each tick
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub warning_nodes: usize,
    pub critical_nodes: usize,
    pub unknown_nodes: usize,
    /// Nodes whose panel status is disconnected or error
    pub offline_nodes: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SystemMetrics {
    pub fn health_percentage(&self) -> f64 {
        if self.total_nodes == 0 {
            return 0.0;
        }
        self.healthy_nodes as f64 / self.total_nodes as f64 * 100.0
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Critical,
    Warning,
}

/// A derived alert; node fields are absent for system-level alerts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub node_id: Option<i64>,
    pub node_name: Option<String>,
    pub message: String,
    pub status: Option<NodeStatus>,
    pub response_time_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Event fanned out to monitoring subscribers
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    MetricsUpdate {
        node_metrics: HashMap<i64, NodeMetrics>,
        system: SystemMetrics,
        timestamp: DateTime<Utc>,
    },
    ForcedUpdate {
        node_metrics: HashMap<i64, NodeMetrics>,
        system: SystemMetrics,
        timestamp: DateTime<Utc>,
    },
}

/// Monitoring engine configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Tick interval; floored at 10 seconds
    pub interval: Duration,
    /// Samples retained per node
    pub history_size: usize,
    /// TCP probe timeout
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            history_size: 100,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    node_metrics: HashMap<i64, NodeMetrics>,
    history: HashMap<i64, VecDeque<NodeMetrics>>,
    system: SystemMetrics,
}

/// Periodic, cancellable fleet health monitor.
///
/// Owns the metrics map and per-node history rings; nothing else writes
/// to them. Updates fan out through a broadcast channel, so a slow or
/// dropped subscriber never affects the tick.
pub struct MonitoringEngine {
    client: Arc<PanelClient>,
    cache: Arc<CacheStore>,
    config: MonitorConfig,
    state: Arc<RwLock<MonitorState>>,
    events: broadcast::Sender<MonitorEvent>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitoringEngine {
    pub fn new(client: Arc<PanelClient>, cache: Arc<CacheStore>, mut config: MonitorConfig) -> Self {
        config.interval = config.interval.max(Duration::from_secs(10));
        config.history_size = config.history_size.max(1);
        let (events, _) = broadcast::channel(16);

        Self {
            client,
            cache,
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
            events,
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Subscribe to metric updates
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the monitoring loop; starting twice is a no-op
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Monitoring is already running");
            return;
        }

        let client = Arc::clone(&self.client);
        let cache = Arc::clone(&self.cache);
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            info!(interval_secs = config.interval.as_secs(), "Monitoring loop started");

            while running.load(Ordering::SeqCst) {
                let started = Instant::now();

                match run_tick(&client, &cache, &config, &state).await {
                    Ok((node_metrics, system)) => {
                        counter!("control_monitor_ticks_total", 1);
                        let _ = events.send(MonitorEvent::MetricsUpdate {
                            node_metrics,
                            system,
                            timestamp: Utc::now(),
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Monitoring tick failed");
                        tokio::time::sleep(TICK_ERROR_BACKOFF).await;
                        continue;
                    }
                }

                let elapsed = started.elapsed();
                let sleep_for = config.interval.saturating_sub(elapsed);
                tokio::time::sleep(sleep_for).await;
            }

            info!("Monitoring loop stopped");
        });

        *self.task.lock().expect("task mutex poisoned") = Some(handle);
    }

    /// Stop the loop and await its completion
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let task = self.task.lock().expect("task mutex poisoned").take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        info!("Monitoring stopped");
    }

    /// Run one collection immediately and emit a forced-update event
    pub async fn force_update(&self) -> Result<()> {
        let (node_metrics, system) =
            run_tick(&self.client, &self.cache, &self.config, &self.state).await?;

        let _ = self.events.send(MonitorEvent::ForcedUpdate {
            node_metrics,
            system,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn node_metrics(&self) -> HashMap<i64, NodeMetrics> {
        self.state.read().await.node_metrics.clone()
    }

    pub async fn system_metrics(&self) -> SystemMetrics {
        self.state.read().await.system.clone()
    }

    /// Most recent history samples for one node, newest last
    pub async fn node_history(&self, node_id: i64, limit: usize) -> Vec<NodeMetrics> {
        let state = self.state.read().await;
        match state.history.get(&node_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Alerts derived from the current state
    pub async fn alerts(&self) -> Vec<Alert> {
        let state = self.state.read().await;
        build_alerts(&state.node_metrics, &state.system)
    }
}

/// One full collection pass: list, probe, derive, retain, cache
async fn run_tick(
    client: &PanelClient,
    cache: &CacheStore,
    config: &MonitorConfig,
    state: &RwLock<MonitorState>,
) -> Result<(HashMap<i64, NodeMetrics>, SystemMetrics)> {
    let nodes = client.list_nodes().await?;

    let probes = join_all(nodes.iter().map(|node| async move {
        let response_time_ms = probe_node(&node.address, node.port, config.probe_timeout).await;
        collect_node_metrics(node, response_time_ms)
    }))
    .await;

    let mut node_metrics = HashMap::with_capacity(probes.len());
    for metrics in probes {
        node_metrics.insert(metrics.node_id, metrics);
    }

    let system = compute_system_metrics(&node_metrics);

    {
        let mut guard = state.write().await;
        for metrics in node_metrics.values() {
            let ring = guard
                .history
                .entry(metrics.node_id)
                .or_insert_with(|| VecDeque::with_capacity(config.history_size));
            if ring.len() == config.history_size {
                ring.pop_front();
            }
            ring.push_back(metrics.clone());
        }
        guard.node_metrics = node_metrics.clone();
        guard.system = system.clone();
    }

    gauge!("control_monitor_total_nodes", system.total_nodes as f64);
    gauge!("control_monitor_healthy_nodes", system.healthy_nodes as f64);
    gauge!("control_monitor_critical_nodes", system.critical_nodes as f64);

    // Cache failures degrade to in-memory state only
    if let Err(e) = cache
        .set(
            "monitoring:node_metrics",
            &serde_json::to_value(&node_metrics)?,
            Some(METRICS_CACHE_TTL),
            &["monitoring"],
        )
        .await
    {
        warn!(error = %e, "Failed to cache node metrics");
    }
    if let Err(e) = cache
        .set(
            "monitoring:system_metrics",
            &serde_json::to_value(&system)?,
            Some(METRICS_CACHE_TTL),
            &["monitoring"],
        )
        .await
    {
        warn!(error = %e, "Failed to cache system metrics");
    }

    debug!(
        nodes = system.total_nodes,
        healthy = system.healthy_nodes,
        "Monitoring tick complete"
    );

    Ok((node_metrics, system))
}

fn collect_node_metrics(node: &Node, response_time_ms: Option<f64>) -> NodeMetrics {
    NodeMetrics {
        node_id: node.id,
        node_name: node.name.clone(),
        status: node.status,
        response_time_ms,
        health: classify_health(node.status, response_time_ms),
        last_seen: Utc::now(),
    }
}

/// Bounded-time TCP connect to the node's service port
async fn probe_node(address: &str, port: u16, timeout: Duration) -> Option<f64> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((address, port))).await {
        Ok(Ok(_stream)) => Some(started.elapsed().as_secs_f64() * 1000.0),
        _ => None,
    }
}

/// Health derivation table
pub fn classify_health(status: NodeStatus, response_time_ms: Option<f64>) -> HealthStatus {
    match status {
        NodeStatus::Connected => match response_time_ms {
            Some(rt) if rt < 100.0 => HealthStatus::Healthy,
            Some(rt) if rt < 500.0 => HealthStatus::Warning,
            _ => HealthStatus::Critical,
        },
        NodeStatus::Connecting => HealthStatus::Warning,
        NodeStatus::Disconnected | NodeStatus::Error => HealthStatus::Critical,
        NodeStatus::Disabled => HealthStatus::Unknown,
    }
}

fn compute_system_metrics(node_metrics: &HashMap<i64, NodeMetrics>) -> SystemMetrics {
    let mut system = SystemMetrics {
        total_nodes: node_metrics.len(),
        last_updated: Some(Utc::now()),
        ..SystemMetrics::default()
    };

    for metrics in node_metrics.values() {
        match metrics.health {
            HealthStatus::Healthy => system.healthy_nodes += 1,
            HealthStatus::Warning => system.warning_nodes += 1,
            HealthStatus::Critical => system.critical_nodes += 1,
            HealthStatus::Unknown => system.unknown_nodes += 1,
        }
        if matches!(metrics.status, NodeStatus::Disconnected | NodeStatus::Error) {
            system.offline_nodes += 1;
        }
    }

    system
}

fn build_alerts(node_metrics: &HashMap<i64, NodeMetrics>, system: &SystemMetrics) -> Vec<Alert> {
    let now = Utc::now();
    let mut alerts = Vec::new();

    for metrics in node_metrics.values() {
        match metrics.health {
            HealthStatus::Critical => alerts.push(Alert {
                kind: AlertKind::Critical,
                node_id: Some(metrics.node_id),
                node_name: Some(metrics.node_name.clone()),
                message: format!("Node {} is in critical state", metrics.node_name),
                status: Some(metrics.status),
                response_time_ms: None,
                timestamp: now,
            }),
            HealthStatus::Warning => alerts.push(Alert {
                kind: AlertKind::Warning,
                node_id: Some(metrics.node_id),
                node_name: Some(metrics.node_name.clone()),
                message: format!("Node {} has performance issues", metrics.node_name),
                status: Some(metrics.status),
                response_time_ms: metrics.response_time_ms,
                timestamp: now,
            }),
            _ => {}
        }
    }

    let health_pct = system.health_percentage();
    if system.total_nodes > 0 {
        if health_pct < 50.0 {
            alerts.push(Alert {
                kind: AlertKind::Critical,
                node_id: None,
                node_name: None,
                message: format!("System health is critical: {:.1}%", health_pct),
                status: None,
                response_time_ms: None,
                timestamp: now,
            });
        } else if health_pct < 80.0 {
            alerts.push(Alert {
                kind: AlertKind::Warning,
                node_id: None,
                node_name: None,
                message: format!("System health is degraded: {:.1}%", health_pct),
                status: None,
                response_time_ms: None,
                timestamp: now,
            });
        }
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(node_id: i64, status: NodeStatus, rt: Option<f64>) -> NodeMetrics {
        NodeMetrics {
            node_id,
            node_name: format!("n{}", node_id),
            status,
            response_time_ms: rt,
            health: classify_health(status, rt),
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_health_table() {
        use HealthStatus::*;
        use NodeStatus::*;

        assert_eq!(classify_health(Connected, Some(40.0)), Healthy);
        assert_eq!(classify_health(Connected, Some(99.9)), Healthy);
        assert_eq!(classify_health(Connected, Some(100.0)), Warning);
        assert_eq!(classify_health(Connected, Some(499.0)), Warning);
        assert_eq!(classify_health(Connected, Some(500.0)), Critical);
        assert_eq!(classify_health(Connected, None), Critical);
        assert_eq!(classify_health(Connecting, None), Warning);
        assert_eq!(classify_health(Disconnected, Some(10.0)), Critical);
        assert_eq!(classify_health(Error, None), Critical);
        assert_eq!(classify_health(Disabled, None), Unknown);
    }

    #[test]
    fn test_system_metrics_buckets_sum_to_total() {
        let mut map = HashMap::new();
        map.insert(1, sample(1, NodeStatus::Connected, Some(10.0)));
        map.insert(2, sample(2, NodeStatus::Connected, Some(200.0)));
        map.insert(3, sample(3, NodeStatus::Disconnected, None));
        map.insert(4, sample(4, NodeStatus::Disabled, None));
        map.insert(5, sample(5, NodeStatus::Error, None));

        let system = compute_system_metrics(&map);
        assert_eq!(system.total_nodes, 5);
        assert_eq!(
            system.healthy_nodes
                + system.warning_nodes
                + system.critical_nodes
                + system.unknown_nodes,
            system.total_nodes
        );
        assert_eq!(system.healthy_nodes, 1);
        assert_eq!(system.warning_nodes, 1);
        assert_eq!(system.critical_nodes, 2);
        assert_eq!(system.unknown_nodes, 1);
        assert_eq!(system.offline_nodes, 2);
        assert!((system.health_percentage() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_alert_derivation() {
        let mut map = HashMap::new();
        map.insert(1, sample(1, NodeStatus::Error, None));
        map.insert(2, sample(2, NodeStatus::Connected, Some(250.0)));
        map.insert(3, sample(3, NodeStatus::Connected, Some(10.0)));

        let system = compute_system_metrics(&map);
        let alerts = build_alerts(&map, &system);

        let node_critical: Vec<_> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::Critical && a.node_id.is_some())
            .collect();
        let node_warning: Vec<_> = alerts
            .iter()
            .filter(|a| a.kind == AlertKind::Warning && a.node_id.is_some())
            .collect();
        assert_eq!(node_critical.len(), 1);
        assert_eq!(node_warning.len(), 1);
        assert_eq!(node_warning[0].response_time_ms, Some(250.0));

        // 1/3 healthy => system critical
        let system_alerts: Vec<_> = alerts.iter().filter(|a| a.node_id.is_none()).collect();
        assert_eq!(system_alerts.len(), 1);
        assert_eq!(system_alerts[0].kind, AlertKind::Critical);
    }

    #[test]
    fn test_system_alert_warning_band() {
        let mut map = HashMap::new();
        for id in 1..=4 {
            map.insert(id, sample(id, NodeStatus::Connected, Some(10.0)));
        }
        map.insert(5, sample(5, NodeStatus::Disconnected, None));

        let system = compute_system_metrics(&map);
        let alerts = build_alerts(&map, &system);

        // 80% healthy is not a system alert; 4/5 = 80% exactly
        assert!(alerts.iter().all(|a| a.node_id.is_some()));
    }

    #[test]
    fn test_empty_fleet_has_no_system_alert() {
        let map = HashMap::new();
        let system = compute_system_metrics(&map);
        assert_eq!(system.health_percentage(), 0.0);
        assert!(build_alerts(&map, &system).is_empty());
    }

    #[tokio::test]
    async fn test_probe_open_and_closed_ports() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let rt = probe_node("127.0.0.1", addr.port(), Duration::from_secs(1)).await;
        assert!(rt.is_some());
        assert!(rt.unwrap() >= 0.0);

        let closed = probe_node("127.0.0.1", 1, Duration::from_millis(500)).await;
        assert!(closed.is_none());

        accept.abort();
    }

    #[test]
    fn test_history_ring_cap() {
        let mut ring: VecDeque<NodeMetrics> = VecDeque::with_capacity(3);
        for i in 0..10 {
            if ring.len() == 3 {
                ring.pop_front();
            }
            ring.push_back(sample(i, NodeStatus::Connected, Some(1.0)));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.front().unwrap().node_id, 7);
        assert_eq!(ring.back().unwrap().node_id, 9);
    }
}
