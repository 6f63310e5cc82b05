//! The node table and the snapshots published from it.
//!
//! The controller is the only writer. Every mutation bumps the table
//! version and publishes a fresh [`ClusterSnapshot`]; readers never see
//! a half-applied transition.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

use nodegrid_core::{
    ClusterSpec, CoordinatorSpec, DesiredStatus, NodeRole, NodeStatus, ProbeKind, WorkerSpec,
};

/// Runtime record of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub name: String,
    pub role: NodeRole,
    pub desired: DesiredStatus,
    pub status: NodeStatus,
    /// Fabric address while attached.
    pub address: Option<Ipv4Addr>,
    /// Coordinator only.
    pub control_port: Option<u16>,
    pub ui_port: Option<u16>,
    /// Restarts in the current failure episode; reset on `Running`.
    pub restart_attempts: u32,
    /// Consecutive failed health probes.
    pub consecutive_failures: u32,
    /// Backoff delays used in the current failure episode.
    pub backoff: Vec<Duration>,
    pub started_at: Option<SystemTime>,
    /// Position in the global launch sequence of the latest launch.
    pub launch_order: Option<u64>,
    pub last_error: Option<String>,
    /// Insertion order; higher means more recently added.
    pub seq: u64,
}

impl NodeState {
    fn new(name: &str, role: NodeRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            desired: DesiredStatus::Running,
            status: NodeStatus::Pending,
            address: None,
            control_port: None,
            ui_port: None,
            restart_attempts: 0,
            consecutive_failures: 0,
            backoff: Vec::new(),
            started_at: None,
            launch_order: None,
            last_error: None,
            seq: 0,
        }
    }

    pub fn coordinator(spec: &CoordinatorSpec) -> Self {
        let mut state = Self::new(&spec.name, NodeRole::Coordinator);
        state.control_port = Some(spec.port);
        state.ui_port = Some(spec.ui_port);
        state
    }

    pub fn worker(spec: &WorkerSpec) -> Self {
        let mut state = Self::new(&spec.name, NodeRole::Worker);
        state.ui_port = Some(spec.ui_port);
        state
    }

    /// A node found in the runtime that the topology no longer declares.
    pub fn stray(name: &str, role: NodeRole) -> Self {
        let mut state = Self::new(name, role);
        state.desired = DesiredStatus::Stopped;
        state
    }

    /// Port the health probe targets.
    pub fn probe_port(&self, kind: &ProbeKind) -> Option<u16> {
        match kind {
            ProbeKind::Tcp => self.control_port.or(self.ui_port),
            ProbeKind::Http { .. } => self.ui_port,
        }
    }

    /// `host:port` of the control endpoint, when known.
    pub fn control_endpoint(&self) -> Option<String> {
        Some(format!("{}:{}", self.address?, self.control_port?))
    }
}

/// How to (re)launch a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    pub image: String,
    pub command: Vec<String>,
    pub memory_bytes: Option<u64>,
    pub core_count: Option<u32>,
}

impl NodeTemplate {
    pub fn coordinator(spec: &CoordinatorSpec) -> Self {
        Self {
            image: spec.image.clone(),
            command: spec.command.clone(),
            memory_bytes: None,
            core_count: None,
        }
    }

    pub fn worker(spec: &WorkerSpec) -> Self {
        Self {
            image: spec.image.clone(),
            command: spec.command.clone(),
            memory_bytes: Some(spec.memory_bytes),
            core_count: Some(spec.core_count),
        }
    }
}

/// All nodes the controller knows about.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: BTreeMap<String, NodeState>,
    templates: HashMap<String, NodeTemplate>,
    next_seq: u64,
    next_launch: u64,
    version: u64,
}

impl NodeTable {
    /// Seed the table with every node a spec declares, all `Pending`.
    pub fn from_spec(spec: &ClusterSpec) -> Self {
        let mut table = Self::default();
        table.insert(
            NodeState::coordinator(&spec.coordinator),
            Some(NodeTemplate::coordinator(&spec.coordinator)),
        );
        for worker in &spec.workers {
            table.insert(NodeState::worker(worker), Some(NodeTemplate::worker(worker)));
        }
        table
    }

    /// Add a node. Returns `false` if the name is already present.
    pub fn insert(&mut self, mut state: NodeState, template: Option<NodeTemplate>) -> bool {
        if self.nodes.contains_key(&state.name) {
            return false;
        }
        state.seq = self.next_seq;
        self.next_seq += 1;
        if let Some(template) = template {
            self.templates.insert(state.name.clone(), template);
        }
        self.nodes.insert(state.name.clone(), state);
        self.version += 1;
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<NodeState> {
        self.templates.remove(name);
        let removed = self.nodes.remove(name);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// Mutable access. Counts as a mutation whether or not the caller
    /// changes anything.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeState> {
        let node = self.nodes.get_mut(name)?;
        self.version += 1;
        Some(node)
    }

    pub fn template(&self, name: &str) -> Option<&NodeTemplate> {
        self.templates.get(name)
    }

    pub fn set_template(&mut self, name: &str, template: NodeTemplate) {
        self.templates.insert(name.to_string(), template);
    }

    /// Next value of the global launch counter.
    pub fn next_launch_order(&mut self) -> u64 {
        self.next_launch += 1;
        self.next_launch
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let mut nodes: Vec<NodeState> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.seq);
        ClusterSnapshot {
            version: self.version,
            published_at: SystemTime::now(),
            nodes,
        }
    }
}

/// Consistent, immutable view of every node at one table version.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub version: u64,
    pub published_at: SystemTime,
    /// Ordered by insertion (`seq`).
    pub nodes: Vec<NodeState>,
}

impl ClusterSnapshot {
    pub fn node(&self, name: &str) -> Option<&NodeState> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// The declared coordinator, or an adopted one when none is declared.
    pub fn coordinator(&self) -> Option<&NodeState> {
        let mut coordinators = self.nodes.iter().filter(|n| n.role == NodeRole::Coordinator);
        let first = coordinators.next()?;
        if first.desired == DesiredStatus::Running {
            return Some(first);
        }
        coordinators
            .find(|n| n.desired == DesiredStatus::Running)
            .or(Some(first))
    }

    pub fn workers(&self) -> impl Iterator<Item = &NodeState> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Worker)
    }

    pub fn status_of(&self, name: &str) -> Option<NodeStatus> {
        self.node(name).map(|n| n.status)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Every node that should run is `Running`, and nothing that should
    /// be stopped is still active.
    pub fn is_converged(&self) -> bool {
        self.nodes.iter().all(|n| match n.desired {
            DesiredStatus::Running => n.status == NodeStatus::Running,
            DesiredStatus::Stopped => !n.status.is_active() && n.status != NodeStatus::Stopping,
        })
    }

    /// First node that wants to run but has given up.
    pub fn first_failed(&self) -> Option<&NodeState> {
        self.nodes
            .iter()
            .find(|n| n.desired == DesiredStatus::Running && n.status == NodeStatus::Failed)
    }
}
