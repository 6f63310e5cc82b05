//! `gridctl up` — bring the cluster up and optionally keep it converged.

use std::path::Path;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing::{error, info};

use nodegrid_converge::{Reconciler, TickClock};
use nodegrid_status::StatusReporter;

use crate::bootstrap::{self, Topology};

pub async fn up(path: &Path, docker: &Path, supervise: bool) -> anyhow::Result<()> {
    let topology = Topology::load(path)?;
    let spec = topology.spec.clone();
    let controller = bootstrap::connect(topology.spec, docker).await?;

    info!(cluster = %spec.name, workers = spec.workers.len(), "bringing cluster up");
    let outcome = controller.up().await;

    let reporter = StatusReporter::new(controller.subscribe(), &spec);
    if let Err(e) = outcome {
        eprint!("{}", reporter.report().render_table());
        return Err(e).with_context(|| format!("cluster {} did not come up", spec.name));
    }

    if !supervise {
        print!("{}", reporter.report().render_table());
        return Ok(());
    }

    let clock = TickClock::new();
    let reporter = reporter.with_clock(clock.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = tokio::spawn(controller.clone().run_health(shutdown_rx.clone()));
    let mut reconciler = Reconciler::new(controller.clone()).with_clock(clock);
    let interval = spec.lifecycle.reconcile_interval;
    let converge = tokio::spawn(async move { reconciler.run(interval, shutdown_rx).await });

    print!("{}", reporter.report().render_table());
    println!("supervising {}; press Ctrl-C to stop supervising", spec.name);

    let mut updates = controller.subscribe();
    let mut reported_failures = 0;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let report = reporter.report();
                let failed = report.failed().count();
                if failed > reported_failures {
                    for row in report.failed() {
                        error!(node = %row.name, error = row.last_error.as_deref().unwrap_or("unknown"), "node failed");
                    }
                }
                reported_failures = failed;
            }
        }
    }

    info!("stopping supervision; nodes are left running");
    let _ = shutdown_tx.send(true);
    let _ = health.await;
    let _ = converge.await;

    let report = reporter.report();
    print!("{}", report.render_table());
    if report.failed().next().is_some() {
        bail!("{} node(s) failed", report.failed().count());
    }
    Ok(())
}
