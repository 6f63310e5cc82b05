//! `gridctl scale` — change the worker count and reconcile to it.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use nodegrid_converge::Reconciler;
use nodegrid_status::StatusReporter;

use crate::bootstrap::{self, Topology};

pub async fn scale(path: &Path, docker: &Path, count: usize) -> anyhow::Result<()> {
    let current = Topology::load(path)?;
    let previous = current.spec.workers.len();

    let scaled = rescale(&current, count)?;
    scaled
        .doc
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!(cluster = %scaled.spec.name, from = previous, to = count, "desired worker count saved");

    let spec = scaled.spec.clone();
    let controller = bootstrap::connect(scaled.spec, docker).await?;
    let mut reconciler = Reconciler::new(controller.clone());
    let outcome = reconciler.settle(spec.lifecycle.up_timeout).await;

    let report = StatusReporter::new(controller.subscribe(), &spec).report();
    print!("{}", report.render_table());
    outcome.with_context(|| format!("cluster {} did not reach {count} worker(s)", spec.name))?;
    Ok(())
}

/// The topology with exactly `count` workers, validated before anything
/// is written.
fn rescale(current: &Topology, count: usize) -> anyhow::Result<Topology> {
    let mut doc = current.doc.clone();
    doc.scale_workers(count);
    Topology::from_document(&current.path, doc)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use nodegrid_core::NodeStatus;
    use nodegrid_fabric::MemoryNetworkDriver;
    use nodegrid_lifecycle::MemoryRuntime;

    use super::*;

    fn write_scaffold(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("nodegrid.toml");
        nodegrid_core::TopologyDocument::scaffold("spark", "img")
            .save(&path)
            .unwrap();
        path
    }

    #[test]
    fn rescale_keeps_existing_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scaffold(dir.path());
        let current = Topology::load(&path).unwrap();

        let grown = rescale(&current, 3).unwrap();
        let names: Vec<_> = grown.spec.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, ["worker-1", "worker-2", "worker-3"]);

        let shrunk = rescale(&current, 1).unwrap();
        assert_eq!(shrunk.spec.workers.len(), 1);
        assert_eq!(shrunk.spec.workers[0].name, "worker-1");
    }

    #[test]
    fn saved_document_reloads_at_the_new_scale() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scaffold(dir.path());
        let scaled = rescale(&Topology::load(&path).unwrap(), 0).unwrap();
        scaled.doc.save(&path).unwrap();

        let reloaded = Topology::load(&path).unwrap();
        assert!(reloaded.spec.workers.is_empty());
        assert!(fs::read_to_string(&path).unwrap().contains("[coordinator]"));
    }

    #[tokio::test(start_paused = true)]
    async fn scaled_topology_converges_on_a_running_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_scaffold(dir.path());
        let current = Topology::load(&path).unwrap();

        let runtime = Arc::new(MemoryRuntime::new());
        let driver = Arc::new(MemoryNetworkDriver::new());
        let controller = bootstrap::assemble(
            current.spec.clone(),
            runtime.clone(),
            runtime.clone(),
            driver.clone(),
        )
        .await
        .unwrap();
        controller.up().await.unwrap();

        // A later invocation sees the scaled document and the running containers.
        let scaled = rescale(&current, 1).unwrap();
        let controller = bootstrap::assemble(scaled.spec.clone(), runtime.clone(), runtime.clone(), driver)
            .await
            .unwrap();
        let mut reconciler = Reconciler::new(controller.clone());
        let snap = reconciler.settle(Duration::from_secs(30)).await.unwrap();

        assert_eq!(snap.status_of("worker-1"), Some(NodeStatus::Running));
        assert!(snap.node("worker-2").is_none());
        assert_eq!(runtime.running(), vec!["coordinator".to_string(), "worker-1".to_string()]);
    }
}
