use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use ipnet::Ipv4Net;
use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ControlError, Result};

/// Ports that suggest a Marzban node is listening
const MARZBAN_PORTS: [u16; 5] = [62050, 62051, 8000, 8080, 8443];

/// Ports probed with an HTTP GET during deep scans
const WEB_PORTS: [u16; 5] = [80, 443, 8000, 8080, 8443];

/// Banner substrings that identify proxy stacks
const MARZBAN_INDICATORS: [&str; 5] = ["marzban", "xray", "v2ray", "trojan", "shadowsocks"];

/// Banner read limits
const BANNER_MAX_BYTES: usize = 1024;
const BANNER_TIMEOUT: Duration = Duration::from_secs(2);

/// Ports a managed node must expose
const REQUIRED_NODE_PORTS: [u16; 2] = [62050, 62051];

/// Probe methods a scan may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMethod {
    Ping,
    PortScan,
    Banner,
    Bandwidth,
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub methods: Vec<ScanMethod>,
    pub target_ports: Vec<u16>,
    /// Connect timeout per probe
    pub timeout: Duration,
    /// Hosts scanned per batch
    pub max_concurrent: usize,
    pub include_localhost: bool,
    pub deep_scan: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            methods: vec![ScanMethod::Ping, ScanMethod::PortScan],
            target_ports: vec![62050, 62051, 22, 80, 443, 8080, 8443],
            timeout: Duration::from_secs(5),
            max_concurrent: 50,
            include_localhost: false,
            deep_scan: false,
        }
    }
}

/// A host found during a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredNode {
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
    pub open_ports: Vec<u16>,
    pub response_time_ms: Option<f64>,
    pub banner_info: Option<String>,
    pub marzban_detected: bool,
    pub detected_version: Option<String>,
    pub discovery_method: Option<ScanMethod>,
    pub discovered_at: DateTime<Utc>,
    /// Heuristic in [0, 100]
    pub confidence_score: f64,
}

impl DiscoveredNode {
    fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            hostname: None,
            open_ports: Vec::new(),
            response_time_ms: None,
            banner_info: None,
            marzban_detected: false,
            detected_version: None,
            discovery_method: None,
            discovered_at: Utc::now(),
            confidence_score: 0.0,
        }
    }
}

/// Progress report sent while a scan runs
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Result of vetting a discovered host as a node candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateValidation {
    pub valid: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Concurrent network scanner for candidate nodes.
///
/// Cancellation is cooperative: the scanning flag is checked before each
/// batch and before each host probe; `stop_discovery` flips it and the
/// partial result set is returned.
pub struct DiscoveryEngine {
    http: reqwest::Client,
    scanning: AtomicBool,
    discovered: DashMap<Ipv4Addr, DiscoveredNode>,
}

impl DiscoveryEngine {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ControlError::Configuration(format!("failed to build client: {}", e)))?;

        Ok(Self {
            http,
            scanning: AtomicBool::new(false),
            discovered: DashMap::new(),
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Halt an in-flight scan before its next batch
    pub fn stop_discovery(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            info!("Discovery scan stopped");
        }
    }

    /// Scan every usable host of a CIDR network
    pub async fn discover_cidr(
        &self,
        cidr: &str,
        config: &DiscoveryConfig,
        progress: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<Vec<DiscoveredNode>> {
        let network: Ipv4Net = cidr
            .parse()
            .map_err(|e| ControlError::Configuration(format!("invalid CIDR '{}': {}", cidr, e)))?;

        let hosts: Vec<Ipv4Addr> = network
            .hosts()
            .filter(|ip| config.include_localhost || !ip.is_loopback())
            .collect();

        info!(cidr = cidr, hosts = hosts.len(), "Starting network discovery");
        self.scan_hosts(hosts, config, progress).await
    }

    /// Scan an inclusive IPv4 range
    pub async fn discover_range(
        &self,
        start: Ipv4Addr,
        end: Ipv4Addr,
        config: &DiscoveryConfig,
        progress: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<Vec<DiscoveredNode>> {
        let (start_n, end_n) = (u32::from(start), u32::from(end));
        if start_n > end_n {
            return Err(ControlError::Configuration(
                "start IP must not be greater than end IP".to_string(),
            ));
        }

        let hosts: Vec<Ipv4Addr> = (start_n..=end_n)
            .map(Ipv4Addr::from)
            .filter(|ip| config.include_localhost || !ip.is_loopback())
            .collect();

        info!(start = %start, end = %end, hosts = hosts.len(), "Starting range discovery");
        self.scan_hosts(hosts, config, progress).await
    }

    /// Scan every local IPv4 network, falling back to common private /24s
    pub async fn discover_local(
        &self,
        config: &DiscoveryConfig,
        progress: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<Vec<DiscoveredNode>> {
        let mut networks = local_networks();

        if networks.is_empty() {
            warn!("No usable interfaces found, probing well-known private networks");
            networks = probe_fallback_networks(config.timeout).await;
        }

        let mut all = Vec::new();
        for network in networks {
            info!(network = %network, "Scanning local network");
            let found = self
                .discover_cidr(&network.to_string(), config, progress.clone())
                .await?;
            all.extend(found);
        }

        Ok(all)
    }

    /// All nodes seen by this engine so far
    pub fn discovered_nodes(&self) -> Vec<DiscoveredNode> {
        self.discovered.iter().map(|e| e.value().clone()).collect()
    }

    /// Hosts that look like Marzban nodes
    pub fn marzban_candidates(&self) -> Vec<DiscoveredNode> {
        self.discovered
            .iter()
            .filter(|e| e.value().marzban_detected || e.value().confidence_score >= 70.0)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn clear_discovered(&self) {
        self.discovered.clear();
        info!("Discovered nodes cleared");
    }

    /// Check whether a discovered host is ready to be added as a node
    pub async fn validate_candidate(&self, node: &DiscoveredNode) -> CandidateValidation {
        let mut validation = CandidateValidation {
            valid: false,
            confidence: node.confidence_score,
            issues: Vec::new(),
            recommendations: Vec::new(),
        };

        let missing: Vec<u16> = REQUIRED_NODE_PORTS
            .iter()
            .copied()
            .filter(|port| !node.open_ports.contains(port))
            .collect();
        if !missing.is_empty() {
            validation
                .issues
                .push(format!("missing required ports: {:?}", missing));
            validation
                .recommendations
                .push("Ensure the node service is running and its ports are open".to_string());
        }

        if node.open_ports.contains(&REQUIRED_NODE_PORTS[0]) {
            let reachable = tokio::time::timeout(
                Duration::from_secs(5),
                TcpStream::connect((node.ip, REQUIRED_NODE_PORTS[0])),
            )
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

            if !reachable {
                validation
                    .issues
                    .push("cannot connect to the node service port".to_string());
                validation
                    .recommendations
                    .push("Check firewall rules and the node configuration".to_string());
            }
        }

        if let Some(rt) = node.response_time_ms {
            if rt > 1000.0 {
                validation
                    .issues
                    .push(format!("high response time: {:.1}ms", rt));
                validation
                    .recommendations
                    .push("Check network connectivity and host load".to_string());
            }
        }

        validation.valid = validation.issues.is_empty() && node.confidence_score >= 50.0;
        validation
    }

    async fn scan_hosts(
        &self,
        hosts: Vec<Ipv4Addr>,
        config: &DiscoveryConfig,
        progress: Option<mpsc::Sender<ScanProgress>>,
    ) -> Result<Vec<DiscoveredNode>> {
        let total = hosts.len();
        let batch_size = config.max_concurrent.max(1);
        let mut found = Vec::new();

        self.scanning.store(true, Ordering::SeqCst);

        for (batch_index, batch) in hosts.chunks(batch_size).enumerate() {
            if !self.is_scanning() {
                debug!("Scan cancelled before batch {}", batch_index + 1);
                break;
            }

            if let Some(progress) = &progress {
                let _ = progress
                    .send(ScanProgress {
                        current: batch_index * batch_size,
                        total,
                        message: format!("Scanning batch {}", batch_index + 1),
                    })
                    .await;
            }

            let results = join_all(batch.iter().map(|ip| self.scan_host(*ip, config))).await;

            for node in results.into_iter().flatten() {
                self.discovered.insert(node.ip, node.clone());
                found.push(node);
            }
        }

        self.scanning.store(false, Ordering::SeqCst);

        if let Some(progress) = &progress {
            let _ = progress
                .send(ScanProgress {
                    current: total,
                    total,
                    message: format!("Discovery completed: {} nodes found", found.len()),
                })
                .await;
        }

        counter!("control_discovery_hosts_found_total", found.len() as u64);
        info!(found = found.len(), "Discovery finished");
        Ok(found)
    }

    async fn scan_host(&self, ip: Ipv4Addr, config: &DiscoveryConfig) -> Option<DiscoveredNode> {
        if !self.is_scanning() {
            return None;
        }

        let mut node = DiscoveredNode::new(ip);

        if config.methods.contains(&ScanMethod::Ping) {
            match ping_host(ip, config.timeout).await {
                Some(latency_ms) => {
                    node.response_time_ms = Some(latency_ms);
                    node.discovery_method = Some(ScanMethod::Ping);
                }
                None => return None,
            }
        }

        if config.methods.contains(&ScanMethod::PortScan) {
            node.open_ports = scan_ports(ip, &config.target_ports, config.timeout).await;
            if !node.open_ports.is_empty() {
                node.discovery_method = Some(ScanMethod::PortScan);
            }
        }

        if config.methods.contains(&ScanMethod::Bandwidth) {
            // No bandwidth probe is implemented; accepted for config compatibility
            debug!(ip = %ip, "Bandwidth method requested, skipping");
        }

        // Unreachable hosts with nothing listening are not reported
        if node.response_time_ms.is_none() && node.open_ports.is_empty() {
            return None;
        }

        node.hostname = reverse_dns(ip).await;

        if config.deep_scan || config.methods.contains(&ScanMethod::Banner) {
            self.deep_scan_host(&mut node, config).await;
        }

        detect_marzban_ports(&mut node);
        node.confidence_score = confidence_score(&node);

        debug!(
            ip = %ip,
            open_ports = node.open_ports.len(),
            marzban = node.marzban_detected,
            score = node.confidence_score,
            "Host scanned"
        );

        Some(node)
    }

    /// Banner grabs plus HTTP header inspection on web ports
    async fn deep_scan_host(&self, node: &mut DiscoveredNode, config: &DiscoveryConfig) {
        for port in node.open_ports.clone() {
            if let Some(banner) = grab_banner(node.ip, port, config.timeout).await {
                let lowered = banner.to_lowercase();
                if MARZBAN_INDICATORS.iter().any(|ind| lowered.contains(ind)) {
                    node.marzban_detected = true;
                }
                if node.detected_version.is_none() {
                    node.detected_version = extract_version(&lowered);
                }
                if node.banner_info.is_none() {
                    node.banner_info = Some(banner);
                }
                if node.discovery_method != Some(ScanMethod::PortScan) {
                    node.discovery_method = Some(ScanMethod::Banner);
                }
            }
        }

        for port in node.open_ports.clone() {
            if !WEB_PORTS.contains(&port) {
                continue;
            }
            let scheme = if port == 443 || port == 8443 { "https" } else { "http" };
            let url = format!("{}://{}:{}", scheme, node.ip, port);

            match self.http.get(&url).send().await {
                Ok(response) => {
                    let server = response
                        .headers()
                        .get(reqwest::header::SERVER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_lowercase();
                    if MARZBAN_INDICATORS.iter().any(|ind| server.contains(ind)) {
                        node.marzban_detected = true;
                    }
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "HTTP probe failed");
                }
            }
        }
    }
}

/// Flag hosts exposing well-known Marzban ports
fn detect_marzban_ports(node: &mut DiscoveredNode) {
    if node.open_ports.iter().any(|p| MARZBAN_PORTS.contains(p)) {
        node.marzban_detected = true;
    }
}

/// Confidence heuristic, capped at 100
fn confidence_score(node: &DiscoveredNode) -> f64 {
    let mut score = 0.0;

    if node.response_time_ms.is_some() {
        score += 20.0;
    }
    if !node.open_ports.is_empty() {
        score += (node.open_ports.len() as f64 * 5.0).min(30.0);
    }
    if node.open_ports.iter().any(|p| MARZBAN_PORTS.contains(p)) {
        score += 30.0;
    }
    if node.marzban_detected {
        score += 40.0;
    }
    if node.detected_version.is_some() {
        score += 10.0;
    }
    if node.hostname.is_some() {
        score += 5.0;
    }
    if matches!(node.response_time_ms, Some(rt) if rt < 50.0) {
        score += 5.0;
    }

    score.min(100.0)
}

fn version_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(marzban|xray|v2ray|version)[\s/]+v?(\d+\.\d+\.\d+)\b").expect("static regex")
    })
}

/// Pull a semantic version out of a lowercased banner
fn extract_version(banner: &str) -> Option<String> {
    version_regex()
        .captures(banner)
        .and_then(|caps| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Single ICMP echo via the system ping binary
async fn ping_host(ip: Ipv4Addr, timeout: Duration) -> Option<f64> {
    let wait_secs = timeout.as_secs().max(1).to_string();
    let started = Instant::now();

    let output = tokio::time::timeout(
        timeout + Duration::from_secs(1),
        tokio::process::Command::new("ping")
            .args(["-c", "1", "-W", &wait_secs, &ip.to_string()])
            .output(),
    )
    .await;

    match output {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            Some(parse_ping_latency(&stdout).unwrap_or(started.elapsed().as_secs_f64() * 1000.0))
        }
        _ => None,
    }
}

fn parse_ping_latency(stdout: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"time[=<]([\d.]+)\s*ms").expect("static regex"));
    re.captures(stdout)?.get(1)?.as_str().parse().ok()
}

/// Concurrent TCP connects across the target port set
async fn scan_ports(ip: Ipv4Addr, ports: &[u16], timeout: Duration) -> Vec<u16> {
    let checks = join_all(ports.iter().map(|&port| async move {
        let open = tokio::time::timeout(timeout, TcpStream::connect((ip, port)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);
        (port, open)
    }))
    .await;

    let mut open: Vec<u16> = checks
        .into_iter()
        .filter_map(|(port, is_open)| is_open.then_some(port))
        .collect();
    open.sort_unstable();
    open
}

/// Best-effort reverse DNS via the system resolver
async fn reverse_dns(ip: Ipv4Addr) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::process::Command::new("getent")
            .args(["hosts", &ip.to_string()])
            .output(),
    )
    .await;

    match output {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout
                .split_whitespace()
                .nth(1)
                .map(|name| name.trim_end_matches('.').to_string())
        }
        _ => None,
    }
}

/// Read up to 1 KiB of banner with a short deadline
async fn grab_banner(ip: Ipv4Addr, port: u16, connect_timeout: Duration) -> Option<String> {
    let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect((ip, port)))
        .await
        .ok()?
        .ok()?;

    let mut buf = vec![0u8; BANNER_MAX_BYTES];
    let read = tokio::time::timeout(BANNER_TIMEOUT, stream.read(&mut buf))
        .await
        .ok()?
        .ok()?;

    if read == 0 {
        return None;
    }

    let banner = String::from_utf8_lossy(&buf[..read]).trim().to_string();
    (!banner.is_empty()).then_some(banner)
}

/// Non-loopback IPv4 networks of the host's interfaces
fn local_networks() -> Vec<Ipv4Net> {
    let mut networks = Vec::new();

    for interface in pnet::datalink::interfaces() {
        if interface.is_loopback() {
            continue;
        }
        for ip in &interface.ips {
            if let pnet::ipnetwork::IpNetwork::V4(net) = ip {
                if net.ip().is_loopback() {
                    continue;
                }
                if let Ok(parsed) = Ipv4Net::new(net.ip(), net.prefix()) {
                    networks.push(parsed.trunc());
                }
            }
        }
    }

    networks.sort();
    networks.dedup();
    networks
}

/// Probe well-known RFC1918 /24 gateways and keep the first that answers
async fn probe_fallback_networks(timeout: Duration) -> Vec<Ipv4Net> {
    let candidates = [
        "192.168.1.0/24",
        "192.168.0.0/24",
        "10.0.0.0/24",
        "172.16.0.0/24",
    ];

    for candidate in candidates {
        let network: Ipv4Net = match candidate.parse() {
            Ok(net) => net,
            Err(_) => continue,
        };
        if let Some(gateway) = network.hosts().next() {
            if ping_host(gateway, timeout.min(Duration::from_secs(2))).await.is_some() {
                return vec![network];
            }
        }
    }

    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_score_components() {
        let mut node = DiscoveredNode::new(Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(confidence_score(&node), 0.0);

        node.response_time_ms = Some(120.0);
        assert_eq!(confidence_score(&node), 20.0);

        node.response_time_ms = Some(10.0);
        assert_eq!(confidence_score(&node), 25.0);

        node.open_ports = vec![22, 80];
        assert_eq!(confidence_score(&node), 35.0);

        node.open_ports = vec![22, 80, 443, 8081, 9000, 9001, 9002, 9003];
        // Port contribution caps at 30
        assert_eq!(confidence_score(&node), 55.0);

        node.hostname = Some("edge".to_string());
        assert_eq!(confidence_score(&node), 60.0);
    }

    #[test]
    fn test_confidence_score_caps_at_100() {
        let node = DiscoveredNode {
            ip: Ipv4Addr::new(192, 0, 2, 1),
            hostname: Some("node".to_string()),
            open_ports: vec![62050, 62051, 22, 80, 443, 8080],
            response_time_ms: Some(5.0),
            banner_info: Some("marzban v1.2.3".to_string()),
            marzban_detected: true,
            detected_version: Some("1.2.3".to_string()),
            discovery_method: Some(ScanMethod::PortScan),
            discovered_at: Utc::now(),
            confidence_score: 0.0,
        };

        assert_eq!(confidence_score(&node), 100.0);
    }

    #[test]
    fn test_marzban_port_heuristic() {
        let mut node = DiscoveredNode::new(Ipv4Addr::new(192, 0, 2, 1));
        node.open_ports = vec![22, 443];
        detect_marzban_ports(&mut node);
        assert!(!node.marzban_detected);

        node.open_ports = vec![22, 62050];
        detect_marzban_ports(&mut node);
        assert!(node.marzban_detected);

        // Score reflects marzban port + detection
        node.response_time_ms = Some(10.0);
        let score = confidence_score(&node);
        assert!(score >= 70.0, "score was {}", score);
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(
            extract_version("welcome to xray/1.8.4 server"),
            Some("1.8.4".to_string())
        );
        assert_eq!(
            extract_version("marzban v0.4.9 ready"),
            Some("0.4.9".to_string())
        );
        assert_eq!(
            extract_version("server version 2.10.1 (linux)"),
            Some("2.10.1".to_string())
        );
        assert_eq!(extract_version("nginx/1.25.3"), None);
        assert_eq!(extract_version("xray vNaN"), None);
    }

    #[test]
    fn test_parse_ping_latency() {
        let stdout = "64 bytes from 192.0.2.1: icmp_seq=1 ttl=64 time=12.3 ms";
        assert_eq!(parse_ping_latency(stdout), Some(12.3));
        assert_eq!(parse_ping_latency("no echo"), None);
    }

    #[test]
    fn test_scan_method_wire_format() {
        assert_eq!(
            serde_json::to_string(&ScanMethod::PortScan).unwrap(),
            "\"port-scan\""
        );
        let parsed: ScanMethod = serde_json::from_str("\"ping\"").unwrap();
        assert_eq!(parsed, ScanMethod::Ping);
    }

    #[tokio::test]
    async fn test_port_scan_finds_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let open = scan_ports(
            Ipv4Addr::LOCALHOST,
            &[port, 1],
            Duration::from_millis(500),
        )
        .await;
        assert_eq!(open, vec![port]);

        accept.abort();
    }

    #[tokio::test]
    async fn test_discover_range_with_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let engine = DiscoveryEngine::new().unwrap();
        let config = DiscoveryConfig {
            methods: vec![ScanMethod::PortScan],
            target_ports: vec![port],
            timeout: Duration::from_millis(500),
            max_concurrent: 4,
            include_localhost: true,
            deep_scan: false,
        };

        let found = engine
            .discover_range(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &config, None)
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].ip, Ipv4Addr::LOCALHOST);
        assert_eq!(found[0].open_ports, vec![port]);
        assert!(found[0].confidence_score > 0.0);
        assert_eq!(engine.discovered_nodes().len(), 1);

        accept.abort();
    }

    #[tokio::test]
    async fn test_unreachable_hosts_are_not_reported() {
        let engine = DiscoveryEngine::new().unwrap();
        let config = DiscoveryConfig {
            methods: vec![ScanMethod::PortScan],
            target_ports: vec![9],
            timeout: Duration::from_millis(200),
            max_concurrent: 8,
            include_localhost: false,
            deep_scan: false,
        };

        // TEST-NET-3 addresses are never routable
        let found = engine
            .discover_range(
                Ipv4Addr::new(203, 0, 113, 1),
                Ipv4Addr::new(203, 0, 113, 6),
                &config,
                None,
            )
            .await
            .unwrap();

        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_validate_candidate_missing_ports() {
        let engine = DiscoveryEngine::new().unwrap();
        let mut node = DiscoveredNode::new(Ipv4Addr::new(192, 0, 2, 1));
        node.open_ports = vec![22, 80];
        node.confidence_score = 30.0;

        let validation = engine.validate_candidate(&node).await;
        assert!(!validation.valid);
        assert!(validation.issues[0].contains("missing required ports"));
        assert!(!validation.recommendations.is_empty());
    }

    #[tokio::test]
    async fn test_validate_candidate_high_latency() {
        let engine = DiscoveryEngine::new().unwrap();
        let mut node = DiscoveredNode::new(Ipv4Addr::new(192, 0, 2, 1));
        node.open_ports = vec![22];
        node.response_time_ms = Some(2500.0);

        let validation = engine.validate_candidate(&node).await;
        assert!(validation
            .issues
            .iter()
            .any(|issue| issue.contains("high response time")));
    }

    #[test]
    fn test_invalid_range_rejected() {
        let engine = DiscoveryEngine::new().unwrap();
        let config = DiscoveryConfig::default();

        let result = futures::executor::block_on(engine.discover_range(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 0, 0, 1),
            &config,
            None,
        ));

        assert!(matches!(result, Err(ControlError::Configuration(_))));
    }
}
