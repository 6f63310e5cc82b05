//! The container runtime seam.
//!
//! The controller never talks to docker directly. It hands a
//! [`LaunchPlan`] to a [`NodeRuntime`] and asks it about containers by
//! node name.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use nodegrid_core::{Mount, NodeRole};

use crate::error::RuntimeError;

/// Labels stamped on every container so a later run can find them.
pub mod labels {
    pub const CLUSTER: &str = "nodegrid.cluster";
    pub const ROLE: &str = "nodegrid.role";
    pub const NODE: &str = "nodegrid.node";
}

/// A host port published to the same port inside the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl PortMapping {
    pub fn same(port: u16) -> Self {
        Self {
            host: port,
            container: port,
        }
    }
}

/// Everything a runtime needs to launch one node.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub name: String,
    pub role: NodeRole,
    pub image: String,
    /// Command override; empty means the image default.
    pub command: Vec<String>,
    pub network: String,
    pub address: Ipv4Addr,
    pub env: BTreeMap<String, String>,
    /// Mounted read-only.
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
}

/// A container found by [`NodeRuntime::inspect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedNode {
    pub name: String,
    pub role: NodeRole,
    pub running: bool,
    pub address: Option<Ipv4Addr>,
}

/// Launches and stops node containers.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
    /// Create and start a container from `plan`.
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), RuntimeError>;

    /// Ask the node to shut down (SIGTERM). Returns immediately.
    async fn terminate(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force the node down (SIGKILL).
    async fn kill(&self, name: &str) -> Result<(), RuntimeError>;

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError>;

    /// Remove the container. With `purge`, its anonymous volumes go too.
    /// Removing a missing container is not an error.
    async fn remove(&self, name: &str, purge: bool) -> Result<(), RuntimeError>;

    /// Every container labelled as part of `cluster`.
    async fn inspect(&self, cluster: &str) -> Result<Vec<ObservedNode>, RuntimeError>;
}
