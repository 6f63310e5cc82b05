//! Wire a controller from a topology document and the container runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info};

use nodegrid_core::{ClusterSpec, TopologyDocument};
use nodegrid_fabric::{DockerCli, DockerNetworkDriver, FabricManager, NetworkDriver};
use nodegrid_health::{Prober, prober_for};
use nodegrid_lifecycle::runtime::labels;
use nodegrid_lifecycle::{DockerRuntime, LifecycleController, NodeRuntime};

/// A loaded and validated topology document.
pub struct Topology {
    pub path: PathBuf,
    pub doc: TopologyDocument,
    pub spec: ClusterSpec,
}

impl Topology {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let doc = TopologyDocument::from_file(path)?;
        Self::from_document(path, doc)
    }

    /// Validate `doc` as if it were stored at `path`; relative mount
    /// sources resolve against the document's directory.
    pub fn from_document(path: &Path, doc: TopologyDocument) -> anyhow::Result<Self> {
        let mut spec = doc
            .validate()
            .with_context(|| format!("invalid topology {}", path.display()))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        spec.resolve_mount_sources(base);
        debug!(
            cluster = %spec.name,
            workers = spec.workers.len(),
            path = %path.display(),
            "topology loaded"
        );
        Ok(Self {
            path: path.to_path_buf(),
            doc,
            spec,
        })
    }
}

/// Build a controller over `runtime` and adopt whatever containers of
/// this cluster already exist.
pub async fn assemble(
    spec: ClusterSpec,
    runtime: Arc<dyn NodeRuntime>,
    prober: Arc<dyn Prober>,
    driver: Arc<dyn NetworkDriver>,
) -> anyhow::Result<Arc<LifecycleController>> {
    let network_labels = BTreeMap::from([(labels::CLUSTER.to_string(), spec.name.clone())]);
    let fabric = Arc::new(
        FabricManager::new(driver, &spec.network, spec.subnet).with_labels(network_labels),
    );

    let observed = runtime
        .inspect(&spec.name)
        .await
        .context("failed to list existing cluster containers")?;
    if !observed.is_empty() {
        info!(cluster = %spec.name, containers = observed.len(), "found existing containers");
    }

    let controller = LifecycleController::new(spec, runtime, prober, fabric);
    controller
        .adopt(observed)
        .await
        .context("failed to adopt existing containers")?;
    Ok(controller)
}

/// [`assemble`] against docker.
pub async fn connect(spec: ClusterSpec, docker: &Path) -> anyhow::Result<Arc<LifecycleController>> {
    let cli = DockerCli::new(docker).with_timeout(spec.lifecycle.command_timeout);
    let prober = prober_for(&spec.health);
    assemble(
        spec,
        Arc::new(DockerRuntime::new(cli.clone())),
        prober,
        Arc::new(DockerNetworkDriver::new(cli)),
    )
    .await
}
