//! In-process node runtime for tests.
//!
//! `MemoryRuntime` also implements [`Prober`]: a node answers probes
//! while its container runs, unless it has been marked unresponsive.
//! Failure injection covers launch errors, crashes, hangs, and nodes
//! that ignore the graceful stop signal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use nodegrid_health::{ProbeResult, ProbeTarget, Prober};

use crate::error::RuntimeError;
use crate::runtime::{LaunchPlan, NodeRuntime, ObservedNode, labels};

#[derive(Debug, Clone)]
struct Container {
    plan: LaunchPlan,
    running: bool,
}

#[derive(Debug, Default)]
struct Inner {
    containers: BTreeMap<String, Container>,
    /// node → launches still to fail.
    launch_failures: HashMap<String, u32>,
    ignores_sigterm: HashSet<String>,
    unresponsive: HashSet<String>,
    launch_log: Vec<String>,
    /// node → time `launch` takes to return after the container exists.
    launch_delays: HashMap<String, Duration>,
    kills: HashMap<String, u32>,
    purged: Vec<String>,
}

/// A fake container runtime that keeps containers in memory.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T, RuntimeError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| RuntimeError::Other(e.to_string()))?;
        Ok(f(&mut *inner))
    }

    fn read<T: Default>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        self.inner.lock().map(|inner| f(&*inner)).unwrap_or_default()
    }

    /// Make the next `times` launches of `name` fail.
    pub fn fail_launches(&self, name: &str, times: u32) {
        let _ = self.with(|inner| inner.launch_failures.insert(name.to_string(), times));
    }

    /// `launch` of `name` creates the container, then takes `delay` to
    /// return, like a slow `docker run`.
    pub fn delay_launches(&self, name: &str, delay: Duration) {
        let _ = self.with(|inner| inner.launch_delays.insert(name.to_string(), delay));
    }

    /// The container exits on its own.
    pub fn crash(&self, name: &str) {
        let _ = self.with(|inner| {
            if let Some(c) = inner.containers.get_mut(name) {
                c.running = false;
            }
        });
    }

    /// Keep the container running but stop answering probes.
    pub fn set_unresponsive(&self, name: &str, unresponsive: bool) {
        let _ = self.with(|inner| {
            if unresponsive {
                inner.unresponsive.insert(name.to_string());
            } else {
                inner.unresponsive.remove(name);
            }
        });
    }

    /// Make the node ignore SIGTERM so only a kill stops it.
    pub fn ignore_sigterm(&self, name: &str) {
        let _ = self.with(|inner| inner.ignores_sigterm.insert(name.to_string()));
    }

    /// Node names in the order they were successfully launched.
    pub fn launch_log(&self) -> Vec<String> {
        self.read(|inner| inner.launch_log.clone())
    }

    pub fn launch_count(&self, name: &str) -> usize {
        self.read(|inner| inner.launch_log.iter().filter(|n| *n == name).count())
    }

    pub fn kill_count(&self, name: &str) -> u32 {
        self.read(|inner| inner.kills.get(name).copied().unwrap_or(0))
    }

    /// Nodes removed with `purge` set.
    pub fn purged(&self) -> Vec<String> {
        self.read(|inner| inner.purged.clone())
    }

    /// Names of running containers, sorted.
    pub fn running(&self) -> Vec<String> {
        self.read(|inner| {
            inner
                .containers
                .iter()
                .filter(|(_, c)| c.running)
                .map(|(n, _)| n.clone())
                .collect()
        })
    }

    /// Names of all containers, running or not, sorted.
    pub fn containers(&self) -> Vec<String> {
        self.read(|inner| inner.containers.keys().cloned().collect())
    }

    /// The plan a container was last launched from.
    pub fn plan(&self, name: &str) -> Option<LaunchPlan> {
        self.read(|inner| inner.containers.get(name).map(|c| c.plan.clone()))
    }
}

#[async_trait]
impl NodeRuntime for MemoryRuntime {
    async fn launch(&self, plan: &LaunchPlan) -> Result<(), RuntimeError> {
        let delay = self.with(|inner| {
            if let Some(remaining) = inner.launch_failures.get_mut(&plan.name)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(RuntimeError::Other(format!(
                    "injected launch failure for {}",
                    plan.name
                )));
            }
            if inner.containers.get(&plan.name).is_some_and(|c| c.running) {
                return Err(RuntimeError::Other(format!(
                    "container {} is already running",
                    plan.name
                )));
            }
            inner.containers.insert(
                plan.name.clone(),
                Container {
                    plan: plan.clone(),
                    running: true,
                },
            );
            inner.launch_log.push(plan.name.clone());
            debug!(node = %plan.name, "memory container launched");
            Ok(inner.launch_delays.get(&plan.name).copied())
        })??;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn terminate(&self, name: &str) -> Result<(), RuntimeError> {
        self.with(|inner| {
            if inner.ignores_sigterm.contains(name) {
                return;
            }
            if let Some(c) = inner.containers.get_mut(name) {
                c.running = false;
            }
        })
    }

    async fn kill(&self, name: &str) -> Result<(), RuntimeError> {
        self.with(|inner| {
            *inner.kills.entry(name.to_string()).or_default() += 1;
            if let Some(c) = inner.containers.get_mut(name) {
                c.running = false;
            }
        })
    }

    async fn is_running(&self, name: &str) -> Result<bool, RuntimeError> {
        self.with(|inner| inner.containers.get(name).is_some_and(|c| c.running))
    }

    async fn remove(&self, name: &str, purge: bool) -> Result<(), RuntimeError> {
        self.with(|inner| {
            if inner.containers.remove(name).is_some() && purge {
                inner.purged.push(name.to_string());
            }
        })
    }

    async fn inspect(&self, cluster: &str) -> Result<Vec<ObservedNode>, RuntimeError> {
        self.with(|inner| {
            inner
                .containers
                .values()
                .filter(|c| c.plan.labels.get(labels::CLUSTER).map(String::as_str) == Some(cluster))
                .map(|c| ObservedNode {
                    name: c.plan.name.clone(),
                    role: c.plan.role,
                    running: c.running,
                    address: Some(c.plan.address),
                })
                .collect()
        })
    }
}

#[async_trait]
impl Prober for MemoryRuntime {
    async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        let healthy = self.read(|inner| {
            inner.containers.get(&target.node).is_some_and(|c| c.running)
                && !inner.unresponsive.contains(&target.node)
        });
        if healthy {
            ProbeResult::Healthy
        } else {
            ProbeResult::Failed
        }
    }
}
