//! Endpoint table projection and rendering.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use nodegrid_converge::TickClock;
use nodegrid_core::{ClusterSpec, NodeRole, NodeStatus};
use nodegrid_lifecycle::{ClusterSnapshot, NodeState};

/// One node as shown to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRow {
    pub name: String,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// Fabric address.
    pub address: Option<String>,
    /// `address:port` other nodes register against (coordinator only).
    pub control_endpoint: Option<String>,
    /// Dashboard URL on the published host port.
    pub ui_url: Option<String>,
    pub restarts: u32,
    pub last_error: Option<String>,
}

/// Point-in-time status of the whole cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub cluster: String,
    pub network: String,
    /// Snapshot version the report was built from.
    pub version: u64,
    /// The convergence loop has not ticked within two intervals.
    pub stale: bool,
    pub converged: bool,
    pub nodes: Vec<EndpointRow>,
}

impl StatusReport {
    pub fn running(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Running)
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &EndpointRow> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Failed)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render as an aligned text table with a one-line summary.
    pub fn render_table(&self) -> String {
        const HEADERS: [&str; 8] = [
            "NAME", "ROLE", "STATUS", "ADDRESS", "CONTROL", "UI", "RESTARTS", "LAST ERROR",
        ];

        let rows: Vec<[String; 8]> = self
            .nodes
            .iter()
            .map(|n| {
                [
                    n.name.clone(),
                    n.role.to_string(),
                    n.status.to_string(),
                    dash(n.address.as_deref()),
                    dash(n.control_endpoint.as_deref()),
                    dash(n.ui_url.as_deref()),
                    n.restarts.to_string(),
                    dash(n.last_error.as_deref()),
                ]
            })
            .collect();

        let mut widths = HEADERS.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }

        let mut out = String::new();
        push_row(&mut out, &HEADERS.map(String::from), &widths);
        for row in &rows {
            push_row(&mut out, row, &widths);
        }

        out.push('\n');
        out.push_str(&format!(
            "cluster {} (network {}): {}/{} running",
            self.cluster,
            self.network,
            self.running(),
            self.nodes.len()
        ));
        if self.converged {
            out.push_str(", converged");
        }
        out.push('\n');
        if self.stale {
            out.push_str("warning: convergence loop has not ticked recently; state may be out of date\n");
        }
        out
    }
}

fn dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

fn push_row(out: &mut String, cells: &[String; 8], widths: &[usize; 8]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Builds [`StatusReport`]s from the controller's snapshot channel.
pub struct StatusReporter {
    snapshots: watch::Receiver<Arc<ClusterSnapshot>>,
    cluster: String,
    network: String,
    ui_host: String,
    clock: Option<TickClock>,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(snapshots: watch::Receiver<Arc<ClusterSnapshot>>, spec: &ClusterSpec) -> Self {
        Self {
            snapshots,
            cluster: spec.name.clone(),
            network: spec.network.clone(),
            ui_host: spec.health.host.clone(),
            clock: None,
            interval: spec.lifecycle.reconcile_interval,
        }
    }

    /// Judge staleness by this convergence loop's ticks.
    pub fn with_clock(mut self, clock: TickClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn report(&self) -> StatusReport {
        let snapshot = self.snapshots.borrow().clone();
        let stale = self
            .clock
            .as_ref()
            .is_none_or(|clock| clock.is_stale(self.interval));

        StatusReport {
            cluster: self.cluster.clone(),
            network: self.network.clone(),
            version: snapshot.version,
            stale,
            converged: snapshot.is_converged(),
            nodes: snapshot.nodes.iter().map(|n| self.row(n)).collect(),
        }
    }

    fn row(&self, node: &NodeState) -> EndpointRow {
        EndpointRow {
            name: node.name.clone(),
            role: node.role,
            status: node.status,
            address: node.address.map(|a| a.to_string()),
            control_endpoint: node.control_endpoint(),
            ui_url: node
                .ui_port
                .filter(|_| node.status != NodeStatus::Stopped)
                .map(|port| format!("http://{}:{port}", self.ui_host)),
            restarts: node.restart_attempts,
            last_error: node.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use nodegrid_core::TopologyDocument;
    use nodegrid_lifecycle::NodeTable;

    use super::*;

    fn fixture() -> (ClusterSpec, NodeTable) {
        let spec = TopologyDocument::scaffold("spark", "img").validate().unwrap();
        let mut table = NodeTable::from_spec(&spec);
        let coordinator = table.get_mut("coordinator").unwrap();
        coordinator.status = NodeStatus::Running;
        coordinator.address = Some(Ipv4Addr::new(172, 28, 0, 2));
        let w1 = table.get_mut("worker-1").unwrap();
        w1.status = NodeStatus::Running;
        w1.address = Some(Ipv4Addr::new(172, 28, 0, 3));
        let w2 = table.get_mut("worker-2").unwrap();
        w2.status = NodeStatus::Failed;
        w2.restart_attempts = 5;
        w2.last_error = Some("launch failed".to_string());
        (spec, table)
    }

    fn reporter(spec: &ClusterSpec, table: &NodeTable) -> StatusReporter {
        let (_tx, rx) = watch::channel(Arc::new(table.snapshot()));
        StatusReporter::new(rx, spec)
    }

    #[test]
    fn rows_carry_endpoints() {
        let (spec, table) = fixture();
        let report = reporter(&spec, &table).report();

        assert_eq!(report.cluster, "spark");
        assert_eq!(report.nodes.len(), 3);
        let coordinator = &report.nodes[0];
        assert_eq!(coordinator.control_endpoint.as_deref(), Some("172.28.0.2:7077"));
        assert_eq!(coordinator.ui_url.as_deref(), Some("http://127.0.0.1:8080"));

        let w1 = &report.nodes[1];
        assert_eq!(w1.control_endpoint, None);
        assert_eq!(w1.ui_url.as_deref(), Some("http://127.0.0.1:8081"));

        assert_eq!(report.running(), 2);
        assert_eq!(report.failed().count(), 1);
        assert!(!report.converged);
    }

    #[test]
    fn without_a_clock_the_report_is_stale() {
        let (spec, table) = fixture();
        assert!(reporter(&spec, &table).report().stale);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_tick_is_not_stale() {
        let (spec, table) = fixture();
        let clock = TickClock::new();
        clock.record();
        let report = reporter(&spec, &table).with_clock(clock).report();
        assert!(!report.stale);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ticks_make_the_report_stale() {
        let (spec, table) = fixture();
        let clock = TickClock::new();
        clock.record();
        tokio::time::advance(spec.lifecycle.reconcile_interval * 3).await;
        let report = reporter(&spec, &table).with_clock(clock).report();
        assert!(report.stale);
    }

    #[test]
    fn table_is_aligned() {
        let (spec, table) = fixture();
        let text = reporter(&spec, &table).report().render_table();
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].starts_with("NAME"));
        let status_col = lines[0].find("STATUS").unwrap();
        assert_eq!(&lines[1][status_col..status_col + 7], "running");
        assert_eq!(&lines[3][status_col..status_col + 6], "failed");
        assert!(lines[3].ends_with("launch failed"));
        assert!(text.contains("cluster spark (network spark-net): 2/3 running"));
        assert!(text.contains("warning: convergence loop"));
    }

    #[test]
    fn json_round_trips() {
        let (spec, table) = fixture();
        let report = reporter(&spec, &table).report();
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"failed\""));
        let back: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
