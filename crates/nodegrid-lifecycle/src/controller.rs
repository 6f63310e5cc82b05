//! Lifecycle controller — drives every node through its state machine.
//!
//! ```text
//! Pending ──start──▶ Starting ──probe ok──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                      │  ▲                    │
//!          timeout /   │  │ backoff            │ N consecutive
//!          launch err  ▼  │                    ▼ probe failures
//!                    Unreachable ◀─────────────┘
//!                      │
//!                      └── budget exhausted ──▶ Failed
//! ```
//!
//! The controller is the single writer of the node table. Each mutation
//! publishes an `Arc<ClusterSnapshot>` on a watch channel; waits (a worker
//! waiting for its coordinator, `up` waiting for convergence) subscribe to
//! that channel instead of polling the table. Every wait is bounded and
//! also watches the teardown cancellation flag.
//!
//! Each node's start and restart attempts run in their own task, so one
//! node's failure never blocks another's progress.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use nodegrid_core::units::format_size;
use nodegrid_core::{ClusterSpec, DesiredStatus, NodeRole, NodeStatus, WorkerSpec, env};
use nodegrid_fabric::FabricManager;
use nodegrid_health::{HealthStatus, HealthTracker, ProbeResult, ProbeTarget, Prober};

use crate::error::{ClusterError, ClusterResult, RuntimeError};
use crate::retry::RetryPolicy;
use crate::runtime::{LaunchPlan, NodeRuntime, ObservedNode, PortMapping, labels};
use crate::table::{ClusterSnapshot, NodeState, NodeTable, NodeTemplate};

/// Upper bound on how often a starting or stopping node is polled.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Owns the node table and every in-flight lifecycle task.
pub struct LifecycleController {
    spec: ClusterSpec,
    runtime: Arc<dyn NodeRuntime>,
    prober: Arc<dyn Prober>,
    fabric: Arc<FabricManager>,
    retry: RetryPolicy,
    table: RwLock<NodeTable>,
    snapshots: watch::Sender<Arc<ClusterSnapshot>>,
    trackers: Mutex<HashMap<String, HealthTracker>>,
    /// node → its start / restart task.
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Raised by `teardown`; every wait point selects on it.
    cancel: watch::Sender<bool>,
}

impl LifecycleController {
    /// Create a controller with every declared node `Pending`.
    pub fn new(
        spec: ClusterSpec,
        runtime: Arc<dyn NodeRuntime>,
        prober: Arc<dyn Prober>,
        fabric: Arc<FabricManager>,
    ) -> Arc<Self> {
        let table = NodeTable::from_spec(&spec);
        let (snapshots, _) = watch::channel(Arc::new(table.snapshot()));
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            retry: RetryPolicy::from_settings(&spec.retry),
            spec,
            runtime,
            prober,
            fabric,
            table: RwLock::new(table),
            snapshots,
            trackers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn cluster(&self) -> &str {
        &self.spec.name
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receive a new snapshot after every table mutation.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterSnapshot>> {
        self.snapshots.subscribe()
    }

    // ── Start ─────────────────────────────────────────────────────

    /// Start one node and wait until it answers probes.
    ///
    /// A worker first waits for the coordinator to be `Running`. On a
    /// retryable failure the node becomes `Unreachable`, a backoff restart
    /// continues in the background, and the error is returned. If a start
    /// or restart of the node is already in flight, waits for that one to
    /// bring the node up or give up instead.
    pub async fn start(self: &Arc<Self>, name: &str) -> ClusterResult<()> {
        let (first_tx, first_rx) = oneshot::channel();
        if self.spawn_supervisor(name, false, Some(first_tx)).await {
            return first_rx.await.unwrap_or(Err(ClusterError::Cancelled));
        }

        let what = format!("{name} to start");
        self.wait_for(self.spec.lifecycle.up_timeout, &what, |snapshot| {
            let Some(node) = snapshot.node(name) else {
                return Some(Err(ClusterError::UnknownNode(name.to_string())));
            };
            match node.status {
                NodeStatus::Running => Some(Ok(())),
                NodeStatus::Failed => Some(Err(ClusterError::NodeFailed {
                    node: node.name.clone(),
                    attempts: node.restart_attempts,
                })),
                _ => None,
            }
        })
        .await
        .map(|_| ())
    }

    /// Start a node in the background, retrying with backoff on failure.
    ///
    /// No-op while another start or restart task for the node is still
    /// in flight.
    pub async fn spawn_start(self: &Arc<Self>, name: &str) {
        self.spawn_supervisor(name, false, None).await;
    }

    /// Returns `false` if a task for the node is already in flight.
    async fn spawn_supervisor(
        self: &Arc<Self>,
        name: &str,
        backoff_first: bool,
        first: Option<oneshot::Sender<ClusterResult<()>>>,
    ) -> bool {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.get(name)
            && !handle.is_finished()
        {
            debug!(node = %name, "start already in flight");
            return false;
        }
        let handle = tokio::spawn(Arc::clone(self).supervise(name.to_string(), backoff_first, first));
        tasks.insert(name.to_string(), handle);
        true
    }

    /// Per-node start loop: attempt, and on a retryable failure back off
    /// and try again until `Running`, `Failed`, or cancelled. The outcome
    /// of the first attempt is reported on `first`.
    async fn supervise(
        self: Arc<Self>,
        name: String,
        mut backoff_first: bool,
        mut first: Option<oneshot::Sender<ClusterResult<()>>>,
    ) {
        let mut cancel = self.cancel.subscribe();
        loop {
            if backoff_first {
                let Some(delay) = self.next_backoff(&name).await else {
                    return;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel) => {
                        debug!(node = %name, "restart cancelled during backoff");
                        return;
                    }
                }
            }
            backoff_first = true;

            let outcome = self.start_once(&name).await;
            let retry = match &outcome {
                Ok(()) => false,
                Err(e) => {
                    self.record_start_failure(&name, e).await;
                    e.is_retryable()
                }
            };
            if let Some(tx) = first.take() {
                let _ = tx.send(outcome);
            }
            if !retry {
                return;
            }
        }
    }

    /// Consume one restart from the node's budget and return the delay to
    /// wait first. Marks the node `Failed` once the budget is spent.
    async fn next_backoff(&self, name: &str) -> Option<Duration> {
        let mut table = self.table.write().await;
        let node = table.get_mut(name)?;
        if node.status == NodeStatus::Failed || node.desired == DesiredStatus::Stopped {
            return None;
        }

        let attempt = node.restart_attempts + 1;
        if !self.retry.allows(attempt) {
            node.status = NodeStatus::Failed;
            let reason = node.last_error.clone().unwrap_or_default();
            node.last_error = Some(format!(
                "gave up after {} restart attempts: {reason}",
                node.restart_attempts
            ));
            warn!(node = %name, attempts = node.restart_attempts, "node failed, retry budget exhausted");
            self.publish(&table);
            return None;
        }

        let delay = self.retry.delay(node.restart_attempts);
        node.restart_attempts = attempt;
        node.backoff.push(delay);
        info!(node = %name, attempt, delay_ms = delay.as_millis() as u64, "restart scheduled");
        self.publish(&table);
        Some(delay)
    }

    async fn start_once(&self, name: &str) -> ClusterResult<()> {
        let mut cancel = self.cancel.subscribe();
        self.ensure_not_cancelled()?;

        let (role, status, attempts) = {
            let table = self.table.read().await;
            let node = table
                .get(name)
                .ok_or_else(|| ClusterError::UnknownNode(name.to_string()))?;
            (node.role, node.status, node.restart_attempts)
        };
        match status {
            NodeStatus::Running => return Ok(()),
            NodeStatus::Failed => {
                return Err(ClusterError::NodeFailed {
                    node: name.to_string(),
                    attempts,
                });
            }
            _ => {}
        }

        self.update(name, |n| {
            n.desired = DesiredStatus::Running;
            n.status = NodeStatus::Starting;
        })
        .await?;
        debug!(node = %name, %role, "starting");

        let coordinator = match role {
            NodeRole::Worker => Some(self.wait_for_coordinator(&mut cancel).await?),
            NodeRole::Coordinator => None,
        };

        self.fabric.create_fabric().await?;
        let address = self.fabric.attach(name).await?;
        let plan = self.plan_for(name, address, coordinator).await?;

        // A container left over from an earlier attempt would clash on name.
        self.runtime
            .remove(name, false)
            .await
            .map_err(|source| ClusterError::Launch {
                node: name.to_string(),
                source,
            })?;
        self.runtime
            .launch(&plan)
            .await
            .map_err(|source| ClusterError::Launch {
                node: name.to_string(),
                source,
            })?;

        {
            let mut table = self.table.write().await;
            let order = table.next_launch_order();
            if let Some(node) = table.get_mut(name) {
                node.address = Some(address);
                node.started_at = Some(SystemTime::now());
                node.launch_order = Some(order);
            }
            self.publish(&table);
        }

        self.wait_ready(name, &mut cancel).await?;

        self.trackers.lock().await.remove(name);
        self.update(name, |n| {
            n.status = NodeStatus::Running;
            n.restart_attempts = 0;
            n.consecutive_failures = 0;
            n.backoff.clear();
            n.last_error = None;
        })
        .await?;
        info!(node = %name, %role, %address, "node running");
        Ok(())
    }

    async fn record_start_failure(&self, name: &str, err: &ClusterError) {
        let next = match err {
            ClusterError::Cancelled | ClusterError::NodeFailed { .. } | ClusterError::UnknownNode(_) => {
                return;
            }
            e if e.is_retryable() => NodeStatus::Unreachable,
            _ => NodeStatus::Failed,
        };
        let reason = err.to_string();
        let recorded = self
            .update(name, |n| {
                n.status = next;
                n.last_error = Some(reason.clone());
            })
            .await;
        if let Err(e) = recorded {
            debug!(node = %name, error = %e, "node left the table before its failure was recorded");
            return;
        }
        if next == NodeStatus::Failed {
            warn!(node = %name, error = %reason, "node start failed");
        } else {
            warn!(node = %name, error = %reason, "node unreachable");
        }
    }

    /// Wait (bounded by the readiness timeout) for the coordinator to be
    /// `Running` and return its control endpoint.
    async fn wait_for_coordinator(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> ClusterResult<(Ipv4Addr, u16)> {
        let timeout = self.spec.lifecycle.readiness_timeout;
        let mut rx = self.snapshots.subscribe();
        let wait = async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(c) = snapshot.coordinator()
                    && c.status == NodeStatus::Running
                    && let (Some(address), Some(port)) = (c.address, c.control_port)
                {
                    return Ok((address, port));
                }
                if rx.changed().await.is_err() {
                    return Err(ClusterError::Cancelled);
                }
            }
        };

        tokio::select! {
            res = tokio::time::timeout(timeout, wait) => res.unwrap_or_else(|_| {
                Err(ClusterError::Timeout {
                    what: "coordinator to become reachable".to_string(),
                    after: timeout,
                })
            }),
            _ = cancelled(cancel) => Err(ClusterError::Cancelled),
        }
    }

    /// Probe the node until it answers, bounded by the readiness timeout.
    async fn wait_ready(&self, name: &str, cancel: &mut watch::Receiver<bool>) -> ClusterResult<()> {
        let target = self.probe_target(name).await?;
        let timeout = self.spec.lifecycle.readiness_timeout;
        let poll = self.poll_interval();
        let probe = async {
            loop {
                if self.prober.probe(&target).await.is_healthy() {
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        };

        tokio::select! {
            res = tokio::time::timeout(timeout, probe) => res.map_err(|_| ClusterError::Timeout {
                what: format!("{name} to answer probes on {}", target.address()),
                after: timeout,
            }),
            _ = cancelled(cancel) => Err(ClusterError::Cancelled),
        }
    }

    async fn probe_target(&self, name: &str) -> ClusterResult<ProbeTarget> {
        let table = self.table.read().await;
        let node = table
            .get(name)
            .ok_or_else(|| ClusterError::UnknownNode(name.to_string()))?;
        let port = node
            .probe_port(&self.spec.health.probe)
            .ok_or_else(|| ClusterError::Unreachable {
                node: name.to_string(),
                reason: "no probe port known".to_string(),
            })?;
        Ok(ProbeTarget::new(name, &self.spec.health.host, port))
    }

    async fn plan_for(
        &self,
        name: &str,
        address: Ipv4Addr,
        coordinator: Option<(Ipv4Addr, u16)>,
    ) -> ClusterResult<LaunchPlan> {
        let table = self.table.read().await;
        let node = table
            .get(name)
            .ok_or_else(|| ClusterError::UnknownNode(name.to_string()))?;
        let template = table.template(name).ok_or_else(|| ClusterError::Launch {
            node: name.to_string(),
            source: RuntimeError::Other("node is not declared in the topology".to_string()),
        })?;

        let coordinator = match coordinator {
            Some((addr, port)) => format!("{addr}:{port}"),
            None => format!("{address}:{}", node.control_port.unwrap_or_default()),
        };

        let mut env_vars = self.spec.env.clone();
        env_vars.insert(env::MODE.to_string(), node.role.to_string());
        env_vars.insert(env::COORDINATOR_ADDRESS.to_string(), coordinator);
        env_vars.insert(env::LOCAL_ADDRESS.to_string(), address.to_string());
        if let Some(bytes) = template.memory_bytes {
            env_vars.insert(env::MEMORY_LIMIT.to_string(), format_size(bytes));
        }
        if let Some(cores) = template.core_count {
            env_vars.insert(env::CORE_COUNT.to_string(), cores.to_string());
        }
        if let Some(port) = node.ui_port {
            env_vars.insert(env::UI_PORT.to_string(), port.to_string());
        }

        let ports = node
            .control_port
            .into_iter()
            .chain(node.ui_port)
            .map(PortMapping::same)
            .collect();

        let node_labels = [
            (labels::CLUSTER, self.spec.name.clone()),
            (labels::ROLE, node.role.to_string()),
            (labels::NODE, name.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Ok(LaunchPlan {
            name: name.to_string(),
            role: node.role,
            image: template.image.clone(),
            command: template.command.clone(),
            network: self.fabric.name().to_string(),
            address,
            env: env_vars,
            mounts: self.spec.mounts.clone(),
            ports,
            labels: node_labels,
        })
    }

    // ── Stop ──────────────────────────────────────────────────────

    /// Stop a node: graceful signal, grace period, then kill.
    ///
    /// Cancels any in-flight start or restart of the node. Stopping a
    /// stopped node is a no-op.
    pub async fn stop(&self, name: &str) -> ClusterResult<()> {
        self.stop_node(name, false).await
    }

    async fn stop_node(&self, name: &str, purge: bool) -> ClusterResult<()> {
        let task = self.tasks.lock().await.remove(name);
        if let Some(handle) = task {
            handle.abort();
            // A launch already in progress runs to its next await point;
            // the runtime is only queried once the task is gone.
            let _ = handle.await;
        }

        self.update(name, |n| n.desired = DesiredStatus::Stopped).await?;

        let running = match self.runtime.is_running(name).await {
            Ok(running) => running,
            Err(e) => {
                warn!(node = %name, error = %e, "cannot query container, assuming running");
                true
            }
        };

        if running {
            self.update(name, |n| n.status = NodeStatus::Stopping).await?;
            if let Err(e) = self.runtime.terminate(name).await {
                warn!(node = %name, error = %e, "graceful stop signal failed");
            }
            if !self.wait_exit(name).await {
                warn!(
                    node = %name,
                    grace_ms = self.spec.lifecycle.grace_period.as_millis() as u64,
                    "grace period elapsed, killing"
                );
                self.runtime.kill(name).await?;
            }
        }

        self.runtime.remove(name, purge).await?;
        self.fabric.detach(name).await;
        self.trackers.lock().await.remove(name);

        let previous = self
            .update(name, |n| {
                let previous = n.status;
                n.status = NodeStatus::Stopped;
                n.address = None;
                n.restart_attempts = 0;
                n.consecutive_failures = 0;
                n.backoff.clear();
                previous
            })
            .await?;
        if previous != NodeStatus::Stopped {
            info!(node = %name, from = %previous, purge, "node stopped");
        }
        Ok(())
    }

    /// Poll until the container exits. `false` if the grace period ran out.
    async fn wait_exit(&self, name: &str) -> bool {
        let poll = self.poll_interval();
        let wait = async {
            loop {
                if let Ok(false) = self.runtime.is_running(name).await {
                    return;
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(self.spec.lifecycle.grace_period, wait)
            .await
            .is_ok()
    }

    // ── Health ────────────────────────────────────────────────────

    /// Probe every `Running` node once, concurrently.
    ///
    /// A node that reaches the consecutive-failure threshold becomes
    /// `Unreachable` and a backoff restart is scheduled for it.
    pub async fn probe_all(self: &Arc<Self>) -> Vec<(String, ProbeResult)> {
        let targets: Vec<ProbeTarget> = {
            let snapshot = self.snapshot();
            snapshot
                .nodes
                .iter()
                .filter(|n| n.status == NodeStatus::Running)
                .filter_map(|n| {
                    let port = n.probe_port(&self.spec.health.probe)?;
                    Some(ProbeTarget::new(&n.name, &self.spec.health.host, port))
                })
                .collect()
        };

        let mut probes = JoinSet::new();
        for target in targets {
            let prober = Arc::clone(&self.prober);
            probes.spawn(async move {
                let result = prober.probe(&target).await;
                (target.node, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, result) in &results {
            self.record_probe(name, *result).await;
        }
        results
    }

    async fn record_probe(self: &Arc<Self>, name: &str, result: ProbeResult) {
        let (health, failures) = {
            let mut trackers = self.trackers.lock().await;
            let tracker = trackers
                .entry(name.to_string())
                .or_insert_with(|| HealthTracker::new(self.spec.health.unhealthy_threshold));
            let health = tracker.record(result);
            (health, tracker.consecutive_failures())
        };

        let (unreachable, wanted) = {
            let mut table = self.table.write().await;
            let Some(node) = table.get_mut(name) else {
                return;
            };
            if node.status != NodeStatus::Running {
                return;
            }
            node.consecutive_failures = failures;
            let unreachable = health == HealthStatus::Unhealthy;
            if unreachable {
                node.status = NodeStatus::Unreachable;
                node.last_error = Some(format!("{failures} consecutive probe failures"));
            }
            let wanted = node.desired == DesiredStatus::Running;
            self.publish(&table);
            (unreachable, wanted)
        };

        if unreachable {
            self.trackers.lock().await.remove(name);
            if wanted {
                warn!(node = %name, failures, "node unreachable, scheduling restart");
                self.spawn_supervisor(name, true, None).await;
            } else {
                warn!(node = %name, failures, "undeclared node unreachable");
            }
        }
    }

    /// Probe on the health interval until `shutdown` is raised.
    pub async fn run_health(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.spec.health.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.spec.health.interval.as_millis() as u64, "health loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("health loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    // ── Cluster-wide ──────────────────────────────────────────────

    /// Bring the whole declared cluster up: fabric, then the coordinator,
    /// then every worker concurrently.
    ///
    /// Returns once every declared node is `Running`, or fails with
    /// `NodeFailed` if a node exhausts its retries, or `Timeout` after the
    /// lifecycle's `up_timeout`. `Failed` nodes are given a fresh retry
    /// budget first.
    pub async fn up(self: &Arc<Self>) -> ClusterResult<Arc<ClusterSnapshot>> {
        self.ensure_not_cancelled()?;
        let timeout = self.spec.lifecycle.up_timeout;
        let deadline = Instant::now() + timeout;

        self.fabric.create_fabric().await?;
        self.stop_strays().await;
        self.rearm_failed().await;

        let coordinator = self.spec.coordinator.name.clone();
        self.spawn_start(&coordinator).await;
        self.wait_until(deadline, timeout, "coordinator to start", |snapshot| {
            let node = snapshot.node(&coordinator)?;
            match node.status {
                NodeStatus::Running => Some(Ok(())),
                NodeStatus::Failed => Some(Err(ClusterError::NodeFailed {
                    node: node.name.clone(),
                    attempts: node.restart_attempts,
                })),
                _ => None,
            }
        })
        .await?;

        let workers: Vec<String> = self
            .snapshot()
            .workers()
            .filter(|w| w.desired == DesiredStatus::Running || self.spec.worker(&w.name).is_some())
            .map(|w| w.name.clone())
            .collect();
        for worker in &workers {
            self.spawn_start(worker).await;
        }

        let snapshot = self
            .wait_until(deadline, timeout, "cluster to converge", |snapshot| {
                if snapshot.is_converged() {
                    return Some(Ok(()));
                }
                snapshot.first_failed().map(|node| {
                    Err(ClusterError::NodeFailed {
                        node: node.name.clone(),
                        attempts: node.restart_attempts,
                    })
                })
            })
            .await?;
        info!(cluster = %self.spec.name, nodes = snapshot.nodes.len(), "cluster up");
        Ok(snapshot)
    }

    /// Stop nodes found in the runtime that the topology does not declare.
    async fn stop_strays(&self) {
        let strays: Vec<String> = self
            .snapshot()
            .nodes
            .iter()
            .filter(|n| !self.spec.declares(&n.name, n.role))
            .filter(|n| n.status != NodeStatus::Stopped)
            .map(|n| n.name.clone())
            .collect();
        for name in strays {
            if let Err(e) = self.stop(&name).await {
                warn!(node = %name, error = %e, "failed to stop undeclared node");
            }
        }
    }

    async fn rearm_failed(&self) {
        let mut table = self.table.write().await;
        let mut rearmed = false;
        for name in table.names() {
            if let Some(node) = table.get_mut(&name)
                && node.status == NodeStatus::Failed
            {
                node.status = NodeStatus::Stopped;
                node.restart_attempts = 0;
                node.backoff.clear();
                rearmed = true;
                info!(node = %name, "failed node re-armed");
            }
        }
        if rearmed {
            self.publish(&table);
        }
    }

    /// Stop every node (workers newest first, coordinator last) and remove
    /// the fabric.
    ///
    /// In-flight starts are cancelled cooperatively first. Safe to call
    /// repeatedly and on a partially started cluster. With `purge`, node
    /// volumes are removed as well.
    pub async fn teardown(&self, purge: bool) -> ClusterResult<()> {
        info!(cluster = %self.spec.name, purge, "tearing down");
        self.cancel.send_replace(true);

        let tasks: Vec<(String, JoinHandle<()>)> = self.tasks.lock().await.drain().collect();
        for (name, mut handle) in tasks {
            if tokio::time::timeout(self.spec.lifecycle.grace_period, &mut handle)
                .await
                .is_err()
            {
                debug!(node = %name, "start task did not yield, aborting");
                handle.abort();
            }
        }

        let mut order: Vec<NodeState> = self.snapshot().nodes.clone();
        order.sort_by_key(|n| (n.role == NodeRole::Coordinator, std::cmp::Reverse(n.seq)));

        let mut first_error = None;
        for node in order {
            if let Err(e) = self.stop_node(&node.name, purge).await {
                warn!(node = %node.name, error = %e, "failed to stop node");
                first_error.get_or_insert(e);
            }
        }

        let fabric = if self.fabric.handle().await.is_some() {
            self.fabric.teardown().await
        } else {
            self.fabric.remove_orphan().await
        };
        if let Err(e) = fabric {
            warn!(network = %self.fabric.name(), error = %e, "failed to remove fabric");
            first_error.get_or_insert(e.into());
        }

        self.cancel.send_replace(false);
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(cluster = %self.spec.name, "teardown complete");
                Ok(())
            }
        }
    }

    /// Rebuild node state from containers found in the runtime, e.g. when
    /// a new process takes over an existing cluster.
    ///
    /// Running containers become `Running` at their current address;
    /// exited ones become `Stopped`. Workers the topology no longer
    /// declares are tracked with desired state `Stopped`.
    pub async fn adopt(&self, observed: Vec<ObservedNode>) -> ClusterResult<()> {
        if observed.is_empty() {
            return Ok(());
        }
        self.fabric.create_fabric().await?;

        for found in observed {
            let address = match found.address {
                Some(address) => match self.fabric.attach_at(&found.name, address).await {
                    Ok(address) => Some(address),
                    Err(e) => {
                        warn!(node = %found.name, error = %e, "cannot reclaim address");
                        None
                    }
                },
                None => None,
            };

            let mut table = self.table.write().await;
            if table.get(&found.name).is_none() {
                debug!(node = %found.name, "adopting undeclared node");
                table.insert(NodeState::stray(&found.name, found.role), None);
            }
            if let Some(node) = table.get_mut(&found.name) {
                node.address = address;
                if found.running {
                    node.status = NodeStatus::Running;
                } else {
                    node.status = NodeStatus::Stopped;
                    node.last_error = Some("container exited".to_string());
                }
                info!(node = %found.name, status = %node.status, "node adopted");
            }
            self.publish(&table);
        }
        Ok(())
    }

    /// Declare a worker added after construction. Returns `false` if the
    /// name was already declared.
    pub async fn register_worker(&self, worker: &WorkerSpec) -> bool {
        let mut table = self.table.write().await;
        if let Some(existing) = table.get(&worker.name) {
            if table.template(&worker.name).is_some() || existing.role != NodeRole::Worker {
                return false;
            }
            // Adopted undeclared node, now declared again.
            table.set_template(&worker.name, NodeTemplate::worker(worker));
            if let Some(node) = table.get_mut(&worker.name) {
                node.ui_port = Some(worker.ui_port);
                node.desired = DesiredStatus::Running;
            }
            self.publish(&table);
            return true;
        }
        table.insert(NodeState::worker(worker), Some(NodeTemplate::worker(worker)));
        self.publish(&table);
        debug!(node = %worker.name, "worker registered");
        true
    }

    /// Drop a node that is not running from the table. Returns `false` if
    /// the node is unknown or still active.
    pub async fn forget(&self, name: &str) -> bool {
        let mut table = self.table.write().await;
        match table.get(name) {
            Some(node) if !node.status.is_active() && node.status != NodeStatus::Stopping => {}
            _ => return false,
        }
        table.remove(name);
        self.publish(&table);
        drop(table);

        if let Some(handle) = self.tasks.lock().await.remove(name) {
            handle.abort();
        }
        self.trackers.lock().await.remove(name);
        self.fabric.detach(name).await;
        debug!(node = %name, "node forgotten");
        true
    }

    /// Wait until `check` returns an outcome for the current snapshot.
    pub async fn wait_for<F>(&self, timeout: Duration, what: &str, check: F) -> ClusterResult<Arc<ClusterSnapshot>>
    where
        F: FnMut(&ClusterSnapshot) -> Option<ClusterResult<()>>,
    {
        self.wait_until(Instant::now() + timeout, timeout, what, check).await
    }

    async fn wait_until<F>(
        &self,
        deadline: Instant,
        after: Duration,
        what: &str,
        mut check: F,
    ) -> ClusterResult<Arc<ClusterSnapshot>>
    where
        F: FnMut(&ClusterSnapshot) -> Option<ClusterResult<()>>,
    {
        let mut rx = self.snapshots.subscribe();
        let mut cancel = self.cancel.subscribe();
        let wait = async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(outcome) = check(&snapshot) {
                    return outcome.map(|()| snapshot);
                }
                if rx.changed().await.is_err() {
                    return Err(ClusterError::Cancelled);
                }
            }
        };

        tokio::select! {
            res = tokio::time::timeout_at(deadline, wait) => res.unwrap_or_else(|_| {
                Err(ClusterError::Timeout {
                    what: what.to_string(),
                    after,
                })
            }),
            _ = cancelled(&mut cancel) => Err(ClusterError::Cancelled),
        }
    }

    // ── Internals ─────────────────────────────────────────────────

    async fn update<T>(&self, name: &str, f: impl FnOnce(&mut NodeState) -> T) -> ClusterResult<T> {
        let mut table = self.table.write().await;
        let node = table
            .get_mut(name)
            .ok_or_else(|| ClusterError::UnknownNode(name.to_string()))?;
        let out = f(node);
        self.publish(&table);
        Ok(out)
    }

    fn publish(&self, table: &NodeTable) {
        self.snapshots.send_replace(Arc::new(table.snapshot()));
    }

    fn ensure_not_cancelled(&self) -> ClusterResult<()> {
        if *self.cancel.borrow() {
            return Err(ClusterError::Cancelled);
        }
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        self.spec.health.interval.min(MAX_POLL_INTERVAL)
    }
}

/// Resolve once the cancellation flag is raised.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|raised| *raised).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use nodegrid_core::{RetrySettings, TopologyDocument};
    use nodegrid_fabric::MemoryNetworkDriver;

    use super::*;
    use crate::memory::MemoryRuntime;

    fn spec(workers: usize) -> ClusterSpec {
        let mut doc = TopologyDocument::scaffold("demo", "img");
        doc.scale_workers(workers);
        let mut spec = doc.validate().unwrap();
        spec.health.interval = Duration::from_millis(100);
        spec.health.timeout = Duration::from_millis(50);
        spec.health.unhealthy_threshold = 3;
        spec.lifecycle.readiness_timeout = Duration::from_secs(2);
        spec.lifecycle.grace_period = Duration::from_secs(1);
        spec.lifecycle.up_timeout = Duration::from_secs(60);
        spec.retry = RetrySettings {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 3,
            jitter: 0.5,
        };
        spec
    }

    struct Harness {
        controller: Arc<LifecycleController>,
        runtime: Arc<MemoryRuntime>,
        driver: Arc<MemoryNetworkDriver>,
    }

    fn harness(spec: ClusterSpec) -> Harness {
        let runtime = Arc::new(MemoryRuntime::new());
        let driver = Arc::new(MemoryNetworkDriver::new());
        let fabric = Arc::new(FabricManager::new(driver.clone(), &spec.network, spec.subnet));
        let controller = LifecycleController::new(spec, runtime.clone(), runtime.clone(), fabric);
        Harness {
            controller,
            runtime,
            driver,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_controller_has_every_node_pending() {
        let h = harness(spec(2));
        let snap = h.controller.snapshot();
        assert_eq!(snap.nodes.len(), 3);
        assert_eq!(snap.count(NodeStatus::Pending), 3);
        assert_eq!(snap.coordinator().unwrap().name, "coordinator");
    }

    #[tokio::test(start_paused = true)]
    async fn starting_the_coordinator_assigns_an_address_and_env() {
        let h = harness(spec(1));
        h.controller.start("coordinator").await.unwrap();

        let snap = h.controller.snapshot();
        let node = snap.node("coordinator").unwrap();
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.address, Some(Ipv4Addr::new(172, 28, 0, 2)));

        let plan = h.runtime.plan("coordinator").unwrap();
        assert_eq!(plan.env[env::MODE], "coordinator");
        assert_eq!(plan.env[env::COORDINATOR_ADDRESS], "172.28.0.2:7077");
        assert_eq!(plan.labels[labels::CLUSTER], "demo");
        assert_eq!(plan.ports, vec![PortMapping::same(7077), PortMapping::same(8080)]);
        assert_eq!(h.driver.networks(), vec![h.controller.spec().network.clone()]);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_env_points_at_the_coordinator() {
        let h = harness(spec(1));
        h.controller.start("coordinator").await.unwrap();
        h.controller.start("worker-1").await.unwrap();

        let plan = h.runtime.plan("worker-1").unwrap();
        assert_eq!(plan.env[env::MODE], "worker");
        assert_eq!(plan.env[env::COORDINATOR_ADDRESS], "172.28.0.2:7077");
        assert_eq!(plan.env[env::LOCAL_ADDRESS], "172.28.0.3");
        assert_eq!(plan.env[env::MEMORY_LIMIT], "1g");
        assert_eq!(plan.env[env::CORE_COUNT], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_without_coordinator_becomes_unreachable() {
        let h = harness(spec(1));
        let err = h.controller.start("worker-1").await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }), "{err}");
        assert_eq!(
            h.controller.snapshot().status_of("worker-1"),
            Some(NodeStatus::Unreachable)
        );
        assert!(h.runtime.launch_log().is_empty());
        h.controller.teardown(false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failures_are_retried_until_running() {
        let h = harness(spec(0));
        h.runtime.fail_launches("coordinator", 2);
        h.controller.spawn_start("coordinator").await;

        let snap = h
            .controller
            .wait_for(Duration::from_secs(30), "coordinator", |s| {
                (s.status_of("coordinator") == Some(NodeStatus::Running)).then_some(Ok(()))
            })
            .await
            .unwrap();
        let node = snap.node("coordinator").unwrap();
        assert_eq!(node.restart_attempts, 0);
        assert_eq!(h.runtime.launch_count("coordinator"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_marks_the_node_failed() {
        let h = harness(spec(0));
        h.runtime.fail_launches("coordinator", 100);
        let mut rx = h.controller.subscribe();
        h.controller.spawn_start("coordinator").await;

        let mut delays = Vec::new();
        loop {
            rx.changed().await.unwrap();
            let snap = rx.borrow_and_update().clone();
            let node = snap.node("coordinator").unwrap();
            if node.backoff.len() > delays.len() {
                delays = node.backoff.clone();
            }
            if node.status == NodeStatus::Failed {
                break;
            }
        }
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[1] > w[0]), "{delays:?}");
        assert!(
            h.controller
                .snapshot()
                .node("coordinator")
                .unwrap()
                .last_error
                .as_deref()
                .unwrap()
                .contains("gave up")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_after_grace_period() {
        let h = harness(spec(0));
        h.controller.start("coordinator").await.unwrap();
        h.runtime.ignore_sigterm("coordinator");

        h.controller.stop("coordinator").await.unwrap();
        assert_eq!(h.runtime.kill_count("coordinator"), 1);
        assert!(h.runtime.running().is_empty());
        let snap = h.controller.snapshot();
        let node = snap.node("coordinator").unwrap();
        assert_eq!(node.status, NodeStatus::Stopped);
        assert_eq!(node.desired, DesiredStatus::Stopped);
        assert_eq!(node.address, None);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_does_not_kill() {
        let h = harness(spec(0));
        h.controller.start("coordinator").await.unwrap();
        h.controller.stop("coordinator").await.unwrap();
        h.controller.stop("coordinator").await.unwrap();
        assert_eq!(h.runtime.kill_count("coordinator"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_unknown_node_errors() {
        let h = harness(spec(0));
        let err = h.controller.stop("ghost").await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownNode(n) if n == "ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn third_probe_failure_marks_unreachable() {
        let mut s = spec(0);
        s.retry.base_delay = Duration::from_secs(30);
        let h = harness(s);
        h.controller.start("coordinator").await.unwrap();
        h.runtime.set_unresponsive("coordinator", true);

        h.controller.probe_all().await;
        h.controller.probe_all().await;
        let snap = h.controller.snapshot();
        assert_eq!(snap.status_of("coordinator"), Some(NodeStatus::Running));
        assert_eq!(snap.node("coordinator").unwrap().consecutive_failures, 2);

        h.controller.probe_all().await;
        assert_eq!(
            h.controller.snapshot().status_of("coordinator"),
            Some(NodeStatus::Unreachable)
        );
        h.controller.teardown(false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_node_is_restarted_after_backoff() {
        let h = harness(spec(0));
        h.controller.start("coordinator").await.unwrap();
        h.runtime.crash("coordinator");
        for _ in 0..3 {
            h.controller.probe_all().await;
        }

        h.controller
            .wait_for(Duration::from_secs(30), "restart", |s| {
                (s.status_of("coordinator") == Some(NodeStatus::Running)).then_some(Ok(()))
            })
            .await
            .unwrap();
        assert_eq!(h.runtime.launch_count("coordinator"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn up_starts_coordinator_before_workers() {
        let h = harness(spec(2));
        let snap = h.controller.up().await.unwrap();
        assert!(snap.is_converged());

        let log = h.runtime.launch_log();
        assert_eq!(log[0], "coordinator");
        assert_eq!(log.len(), 3);

        let coordinator = snap.node("coordinator").unwrap();
        for worker in snap.workers() {
            assert!(worker.launch_order > coordinator.launch_order);
            assert!(worker.started_at >= coordinator.started_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_is_idempotent() {
        let h = harness(spec(2));
        h.controller.up().await.unwrap();

        h.controller.teardown(true).await.unwrap();
        assert!(h.runtime.containers().is_empty());
        assert!(h.driver.networks().is_empty());
        assert_eq!(h.runtime.purged().len(), 3);

        h.controller.teardown(true).await.unwrap();
        assert_eq!(h.controller.snapshot().count(NodeStatus::Stopped), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_waiting_workers() {
        let h = harness(spec(1));
        h.runtime.fail_launches("coordinator", 100);
        h.controller.spawn_start("coordinator").await;
        h.controller.spawn_start("worker-1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.controller.teardown(false).await.unwrap();
        let snap = h.controller.snapshot();
        assert_eq!(snap.count(NodeStatus::Stopped), 2);
        assert!(h.runtime.launch_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn adopt_restores_running_nodes() {
        let h = harness(spec(1));
        h.controller.up().await.unwrap();
        let observed = h.runtime.inspect("demo").await.unwrap();

        let mut s = spec(1);
        s.workers.clear();
        let fabric = Arc::new(FabricManager::new(h.driver.clone(), &s.network, s.subnet));
        let fresh = LifecycleController::new(s, h.runtime.clone(), h.runtime.clone(), fabric);
        fresh.adopt(observed).await.unwrap();

        let snap = fresh.snapshot();
        assert_eq!(snap.status_of("coordinator"), Some(NodeStatus::Running));
        let stray = snap.node("worker-1").unwrap();
        assert_eq!(stray.status, NodeStatus::Running);
        assert_eq!(stray.desired, DesiredStatus::Stopped);
        assert_eq!(stray.address, Some(Ipv4Addr::new(172, 28, 0, 3)));
        assert!(!snap.is_converged());

        fresh.up().await.unwrap();
        assert_eq!(fresh.snapshot().status_of("worker-1"), Some(NodeStatus::Stopped));
        assert_eq!(h.runtime.running(), vec!["coordinator".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn adopted_coordinator_under_an_old_name_is_stopped() {
        let mut old = spec(1);
        old.coordinator.name = "master".to_string();
        let h = harness(old);
        h.controller.up().await.unwrap();
        let observed = h.runtime.inspect("demo").await.unwrap();

        let s = spec(1);
        let fabric = Arc::new(FabricManager::new(h.driver.clone(), &s.network, s.subnet));
        let fresh = LifecycleController::new(s, h.runtime.clone(), h.runtime.clone(), fabric);
        fresh.adopt(observed).await.unwrap();
        assert_eq!(fresh.snapshot().coordinator().unwrap().name, "coordinator");

        let snap = fresh.up().await.unwrap();
        assert!(snap.is_converged());
        assert_eq!(snap.status_of("master"), Some(NodeStatus::Stopped));
        assert_eq!(
            h.runtime.running(),
            vec!["coordinator".to_string(), "worker-1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_a_slow_launch_leaves_no_container() {
        let h = harness(spec(1));
        h.controller.start("coordinator").await.unwrap();
        h.runtime.delay_launches("worker-1", Duration::from_secs(5));

        h.controller.spawn_start("worker-1").await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.runtime.launch_count("worker-1"), 1);

        h.controller.stop("worker-1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.runtime.running(), vec!["coordinator".to_string()]);
        assert_eq!(h.controller.snapshot().status_of("worker-1"), Some(NodeStatus::Stopped));
        assert_eq!(h.runtime.launch_count("worker-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_launch_once() {
        let h = harness(spec(0));
        let (a, b) = tokio::join!(h.controller.start("coordinator"), h.controller.start("coordinator"));
        a.unwrap();
        b.unwrap();
        assert_eq!(h.runtime.launch_count("coordinator"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn register_and_forget_workers() {
        let h = harness(spec(0));
        let extra = WorkerSpec {
            name: "worker-9".to_string(),
            ui_port: 8090,
            memory_bytes: 512 << 20,
            core_count: 1,
            image: "img".to_string(),
            command: Vec::new(),
        };
        assert!(h.controller.register_worker(&extra).await);
        assert!(!h.controller.register_worker(&extra).await);

        h.controller.start("coordinator").await.unwrap();
        h.controller.start("worker-9").await.unwrap();
        assert!(!h.controller.forget("worker-9").await);

        h.controller.stop("worker-9").await.unwrap();
        assert!(h.controller.forget("worker-9").await);
        assert!(h.controller.snapshot().node("worker-9").is_none());
        assert!(!h.controller.forget("worker-9").await);
    }
}
