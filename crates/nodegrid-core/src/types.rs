//! Shared types used across nodegrid crates.
//!
//! `ClusterSpec` and friends are the validated, immutable form of the
//! topology document. `NodeStatus` / `DesiredStatus` describe runtime
//! state and are shared by the lifecycle controller, the convergence
//! loop, and the status reporter.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of a node; unique within a cluster.
pub type NodeName = String;

/// Environment variable names injected into every node.
pub mod env {
    pub const MODE: &str = "MODE";
    pub const COORDINATOR_ADDRESS: &str = "COORDINATOR_ADDRESS";
    pub const LOCAL_ADDRESS: &str = "LOCAL_ADDRESS";
    pub const MEMORY_LIMIT: &str = "MEMORY_LIMIT";
    pub const CORE_COUNT: &str = "CORE_COUNT";
    pub const UI_PORT: &str = "UI_PORT";

    /// Keys the topology's `[env]` table may not override.
    pub const RESERVED: [&str; 6] = [
        MODE,
        COORDINATOR_ADDRESS,
        LOCAL_ADDRESS,
        MEMORY_LIMIT,
        CORE_COUNT,
        UI_PORT,
    ];
}

// ── Roles and status ──────────────────────────────────────────────

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Coordinator,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Coordinator => "coordinator",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(NodeRole::Coordinator),
            "worker" => Ok(NodeRole::Worker),
            other => Err(format!("unknown node role: {other}")),
        }
    }
}

/// Observed lifecycle status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Declared but never started.
    Pending,
    /// Launch requested, waiting for the first successful probe.
    Starting,
    /// Reachable on its control endpoint.
    Running,
    /// Failed its probes or its upstream wait; a retry is scheduled.
    Unreachable,
    /// Graceful shutdown in progress.
    Stopping,
    /// Not running, by request.
    Stopped,
    /// Retry budget exhausted. Never restarted automatically.
    Failed,
}

impl NodeStatus {
    /// Running or on its way there.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Running | NodeStatus::Starting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Starting => "starting",
            NodeStatus::Running => "running",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Stopping => "stopping",
            NodeStatus::Stopped => "stopped",
            NodeStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the controller wants a node to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Running,
    Stopped,
}

// ── Network ───────────────────────────────────────────────────────

/// An IPv4 subnet in CIDR form, e.g. `172.28.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    /// Number of assignable host addresses, excluding the network,
    /// gateway (`.1`), and broadcast addresses.
    pub fn assignable_hosts(&self) -> u32 {
        let size = 1u64 << (32 - self.prefix as u32);
        size.saturating_sub(3).min(u32::MAX as u64) as u32
    }

    /// The gateway address (first host).
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// The `index`-th assignable host address (0-based, starting at `.2`).
    pub fn host(&self, index: u32) -> Option<Ipv4Addr> {
        if index >= self.assignable_hosts() {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + 2 + index))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        };
        u32::from(addr) & mask == u32::from(self.network)
    }
}

impl FromStr for Subnet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("expected CIDR notation, got {s:?}"))?;
        let network: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("bad network address {addr:?}: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("bad prefix length {prefix:?}: {e}"))?;
        if !(8..=30).contains(&prefix) {
            return Err(format!("prefix length must be between 8 and 30, got {prefix}"));
        }
        let mask = u32::MAX << (32 - prefix as u32);
        if u32::from(network) & !mask != 0 {
            return Err(format!("{network} has host bits set for /{prefix}"));
        }
        Ok(Subnet { network, prefix })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

// ── Cluster spec ──────────────────────────────────────────────────

/// A read-only bind mount shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path.
    pub source: PathBuf,
    /// Absolute path inside the node.
    pub target: PathBuf,
}

/// The coordinator node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorSpec {
    pub name: NodeName,
    /// Control (RPC) port workers register against.
    pub port: u16,
    /// Web dashboard port.
    pub ui_port: u16,
    pub image: String,
    /// Optional command override; empty means the image default.
    pub command: Vec<String>,
}

/// A single worker node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub name: NodeName,
    /// Web dashboard port, also used as the worker's probe port.
    pub ui_port: u16,
    /// Memory limit in bytes.
    pub memory_bytes: u64,
    pub core_count: u32,
    pub image: String,
    pub command: Vec<String>,
}

/// How a node's reachability is probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeKind {
    /// TCP connect to the control port (UI port for workers).
    Tcp,
    /// HTTP GET on the UI port; 2xx is healthy.
    Http { path: String },
}

/// Health check parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    pub probe: ProbeKind,
    /// Host the published ports are reachable on.
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures before `Running -> Unreachable`.
    pub unhealthy_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Tcp,
            host: "127.0.0.1".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
        }
    }
}

/// Bounds on every lifecycle wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// How long a worker waits for the coordinator, and how long any node
    /// may take to answer its first probe.
    pub readiness_timeout: Duration,
    /// Time between the graceful stop signal and a forced kill.
    pub grace_period: Duration,
    /// Convergence loop tick interval.
    pub reconcile_interval: Duration,
    /// Overall deadline for `up`.
    pub up_timeout: Duration,
    /// Bound on each container runtime command.
    pub command_timeout: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(5),
            up_timeout: Duration::from_secs(120),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Restart backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Restarts allowed before a node is marked `Failed`.
    pub max_attempts: u32,
    /// Upper bound of the multiplicative jitter, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: 0.5,
        }
    }
}

/// Template for workers added by `scale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDefaults {
    pub name_prefix: String,
    /// Worker `i` (0-based) gets `ui_port_base + i` unless taken.
    pub ui_port_base: u16,
    pub memory_bytes: u64,
    pub core_count: u32,
}

/// Validated desired topology. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    /// Fabric (virtual network) name.
    pub network: String,
    pub subnet: Subnet,
    pub coordinator: CoordinatorSpec,
    /// Workers in declaration order; later entries are "more recently added".
    pub workers: Vec<WorkerSpec>,
    pub mounts: Vec<Mount>,
    /// Extra environment passed to every node.
    pub env: BTreeMap<String, String>,
    pub health: HealthPolicy,
    pub lifecycle: LifecyclePolicy,
    pub retry: RetrySettings,
    pub worker_defaults: WorkerDefaults,
}

impl ClusterSpec {
    pub fn worker(&self, name: &str) -> Option<&WorkerSpec> {
        self.workers.iter().find(|w| w.name == name)
    }

    /// Whether `name` is the declared coordinator or a declared worker
    /// with the given role.
    pub fn declares(&self, name: &str, role: NodeRole) -> bool {
        match role {
            NodeRole::Coordinator => self.coordinator.name == name,
            NodeRole::Worker => self.worker(name).is_some(),
        }
    }

    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.name.as_str())
    }

    /// Total number of nodes, coordinator included.
    pub fn node_count(&self) -> usize {
        self.workers.len() + 1
    }

    /// Make relative mount sources absolute against `base` (the directory
    /// holding the topology document).
    pub fn resolve_mount_sources(&mut self, base: &Path) {
        for mount in &mut self.mounts {
            if mount.source.is_relative() {
                let joined = base.join(&mount.source);
                mount.source = joined.canonicalize().unwrap_or(joined);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_parses_and_allocates_from_dot_two() {
        let subnet: Subnet = "172.28.0.0/16".parse().unwrap();
        assert_eq!(subnet.gateway(), Ipv4Addr::new(172, 28, 0, 1));
        assert_eq!(subnet.host(0), Some(Ipv4Addr::new(172, 28, 0, 2)));
        assert_eq!(subnet.host(300), Some(Ipv4Addr::new(172, 28, 1, 46)));
        assert!(subnet.contains(Ipv4Addr::new(172, 28, 200, 9)));
        assert!(!subnet.contains(Ipv4Addr::new(172, 29, 0, 1)));
    }

    #[test]
    fn subnet_host_capacity() {
        let subnet: Subnet = "10.0.0.0/29".parse().unwrap();
        // 8 addresses minus network, gateway, broadcast.
        assert_eq!(subnet.assignable_hosts(), 5);
        assert!(subnet.host(4).is_some());
        assert!(subnet.host(5).is_none());
    }

    #[test]
    fn subnet_rejects_host_bits_and_bad_prefix() {
        assert!("172.28.0.1/16".parse::<Subnet>().is_err());
        assert!("172.28.0.0/31".parse::<Subnet>().is_err());
        assert!("172.28.0.0".parse::<Subnet>().is_err());
    }

    #[test]
    fn active_statuses() {
        assert!(NodeStatus::Running.is_active());
        assert!(NodeStatus::Starting.is_active());
        assert!(!NodeStatus::Unreachable.is_active());
        assert!(!NodeStatus::Failed.is_active());
    }

    #[test]
    fn relative_mounts_resolve_against_base() {
        let mut spec = ClusterSpec {
            name: "c".to_string(),
            network: "c-net".to_string(),
            subnet: "172.28.0.0/16".parse().unwrap(),
            coordinator: CoordinatorSpec {
                name: "coordinator".to_string(),
                port: 7077,
                ui_port: 8080,
                image: "img".to_string(),
                command: Vec::new(),
            },
            workers: Vec::new(),
            mounts: vec![
                Mount {
                    source: PathBuf::from("data"),
                    target: PathBuf::from("/opt/data"),
                },
                Mount {
                    source: PathBuf::from("/srv/shared"),
                    target: PathBuf::from("/opt/shared"),
                },
            ],
            env: BTreeMap::new(),
            health: HealthPolicy::default(),
            lifecycle: LifecyclePolicy::default(),
            retry: RetrySettings::default(),
            worker_defaults: WorkerDefaults {
                name_prefix: "worker-".to_string(),
                ui_port_base: 8081,
                memory_bytes: 1 << 30,
                core_count: 2,
            },
        };
        spec.resolve_mount_sources(Path::new("/nonexistent/project"));
        assert_eq!(spec.mounts[0].source, PathBuf::from("/nonexistent/project/data"));
        assert_eq!(spec.mounts[1].source, PathBuf::from("/srv/shared"));
    }

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!("worker".parse::<NodeRole>(), Ok(NodeRole::Worker));
        assert_eq!(NodeRole::Coordinator.to_string(), "coordinator");
        assert!("master".parse::<NodeRole>().is_err());
    }
}
