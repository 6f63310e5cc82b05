//! Reconciler — compares observed nodes against the desired topology.
//!
//! Each tick reads the latest snapshot, decides which nodes to start or
//! stop, and hands those requests to the lifecycle controller. Starts are
//! spawned as background tasks; stops are awaited in order. Nodes that
//! are `Unreachable` belong to their retry task, and `Failed` nodes are
//! only reported.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use nodegrid_core::{ClusterSpec, NodeRole, NodeStatus};
use nodegrid_lifecycle::{ClusterError, ClusterResult, ClusterSnapshot, LifecycleController};

use crate::clock::TickClock;

/// Upper bound on the wait between ticks while settling.
const SETTLE_POLL: Duration = Duration::from_millis(200);

/// A single request to the lifecycle controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    Start(String),
    Stop(String),
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Start(name) => write!(f, "start {name}"),
            ReconcileAction::Stop(name) => write!(f, "stop {name}"),
        }
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Requests issued this tick, in order.
    Act(Vec<ReconcileAction>),
    /// Observed already matches desired.
    NoChange,
}

impl Decision {
    pub fn is_no_change(&self) -> bool {
        matches!(self, Decision::NoChange)
    }
}

/// Decide what to do for one snapshot. Pure; performs no I/O.
///
/// - Adopted coordinators other than the declared one are stopped first,
///   since they hold the control port.
/// - The declared coordinator is started when `Pending` or `Stopped`.
/// - Workers no longer in the desired topology are stopped, most recently
///   added first.
/// - Desired workers that are `Pending`, `Stopped`, or not yet in the
///   table are started while fewer desired workers are active
///   (`Running` + `Starting`) than the desired topology declares.
pub fn plan(desired: &ClusterSpec, snapshot: &ClusterSnapshot) -> Decision {
    let mut actions = Vec::new();

    let stale_coordinators = snapshot.nodes.iter().filter(|n| {
        n.role == NodeRole::Coordinator && !desired.declares(&n.name, NodeRole::Coordinator)
    });
    actions.extend(stale_coordinators.map(|n| ReconcileAction::Stop(n.name.clone())));

    if let Some(coordinator) = snapshot.node(&desired.coordinator.name)
        && matches!(coordinator.status, NodeStatus::Pending | NodeStatus::Stopped)
    {
        actions.push(ReconcileAction::Start(coordinator.name.clone()));
    }

    let declared: HashSet<&str> = desired.worker_names().collect();

    let mut surplus: Vec<_> = snapshot
        .workers()
        .filter(|w| !declared.contains(w.name.as_str()))
        .collect();
    surplus.sort_by_key(|w| std::cmp::Reverse(w.seq));
    actions.extend(surplus.into_iter().map(|w| ReconcileAction::Stop(w.name.clone())));

    let active = snapshot
        .workers()
        .filter(|w| declared.contains(w.name.as_str()) && w.status.is_active())
        .count();
    let deficit = desired.workers.len().saturating_sub(active);
    let missing = desired
        .workers
        .iter()
        .filter(|w| match snapshot.status_of(&w.name) {
            None => true,
            Some(status) => matches!(status, NodeStatus::Pending | NodeStatus::Stopped),
        })
        .take(deficit)
        .map(|w| ReconcileAction::Start(w.name.clone()));
    actions.extend(missing);

    if actions.is_empty() {
        Decision::NoChange
    } else {
        Decision::Act(actions)
    }
}

/// Drives the cluster towards the desired topology, one tick at a time.
pub struct Reconciler {
    controller: Arc<LifecycleController>,
    desired: ClusterSpec,
    clock: TickClock,
    /// Failed nodes already reported, so each is warned about once.
    reported_failed: HashSet<String>,
}

impl Reconciler {
    /// Create a reconciler whose desired state is the controller's spec.
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        let desired = controller.spec().clone();
        Self {
            controller,
            desired,
            clock: TickClock::new(),
            reported_failed: HashSet::new(),
        }
    }

    /// Share an existing clock, e.g. with a status reporter.
    pub fn with_clock(mut self, clock: TickClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> TickClock {
        self.clock.clone()
    }

    pub fn desired(&self) -> &ClusterSpec {
        &self.desired
    }

    /// Replace the desired topology, e.g. after a scale edit.
    pub fn set_desired(&mut self, spec: ClusterSpec) {
        info!(
            from = self.desired.workers.len(),
            to = spec.workers.len(),
            "desired worker count changed"
        );
        self.desired = spec;
    }

    /// Run one reconciliation pass.
    pub async fn tick(&mut self) -> Decision {
        for worker in &self.desired.workers {
            self.controller.register_worker(worker).await;
        }

        let snapshot = self.controller.snapshot();
        self.report_failed(&snapshot);

        let decision = plan(&self.desired, &snapshot);
        if let Decision::Act(actions) = &decision {
            for action in actions {
                debug!(%action, "reconcile action");
                self.apply(action).await;
            }
        }

        self.clock.record();
        decision
    }

    async fn apply(&self, action: &ReconcileAction) {
        match action {
            ReconcileAction::Start(name) => self.controller.spawn_start(name).await,
            ReconcileAction::Stop(name) => {
                if let Err(e) = self.controller.stop(name).await {
                    warn!(node = %name, error = %e, "reconcile stop failed");
                    return;
                }
                if !self.desired.declares(name, NodeRole::Worker)
                    && !self.desired.declares(name, NodeRole::Coordinator)
                    && self.controller.forget(name).await
                {
                    info!(node = %name, "node removed from cluster");
                }
            }
        }
    }

    fn report_failed(&mut self, snapshot: &ClusterSnapshot) {
        for node in &snapshot.nodes {
            if node.status == NodeStatus::Failed {
                if self.reported_failed.insert(node.name.clone()) {
                    warn!(
                        node = %node.name,
                        role = %node.role,
                        error = node.last_error.as_deref().unwrap_or("-"),
                        "node failed and will not be restarted"
                    );
                }
            } else {
                self.reported_failed.remove(&node.name);
            }
        }
    }

    /// Whether every desired node is `Running` and nothing undeclared
    /// remains.
    fn is_settled(&self, snapshot: &ClusterSnapshot) -> bool {
        let coordinator_up =
            snapshot.status_of(&self.desired.coordinator.name) == Some(NodeStatus::Running);
        let workers_up = self
            .desired
            .workers
            .iter()
            .all(|w| snapshot.status_of(&w.name) == Some(NodeStatus::Running));
        let no_strays = snapshot
            .nodes
            .iter()
            .all(|n| self.desired.declares(&n.name, n.role));
        coordinator_up && workers_up && no_strays
    }

    /// Tick until a tick changes nothing and every desired node is
    /// `Running`.
    ///
    /// Fails with `NodeFailed` as soon as a desired node is `Failed`, or
    /// `Timeout` once `timeout` elapses.
    pub async fn settle(&mut self, timeout: Duration) -> ClusterResult<Arc<ClusterSnapshot>> {
        let deadline = Instant::now() + timeout;
        let mut updates = self.controller.subscribe();
        let poll = self.controller.spec().lifecycle.reconcile_interval.min(SETTLE_POLL);

        loop {
            let decision = self.tick().await;
            let snapshot = self.controller.snapshot();

            if decision.is_no_change() && self.is_settled(&snapshot) {
                debug!(version = snapshot.version, "cluster settled");
                return Ok(snapshot);
            }
            if let Some(node) = snapshot.first_failed() {
                return Err(ClusterError::NodeFailed {
                    node: node.name.clone(),
                    attempts: node.restart_attempts,
                });
            }
            if Instant::now() >= deadline {
                return Err(ClusterError::Timeout {
                    what: "cluster to settle".to_string(),
                    after: timeout,
                });
            }

            tokio::select! {
                _ = updates.changed() => {}
                _ = tokio::time::sleep(poll) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Tick every `interval` until `shutdown` is raised.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "convergence loop started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Decision::Act(actions) = self.tick().await {
                        debug!(actions = actions.len(), "convergence tick acted");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("convergence loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}
