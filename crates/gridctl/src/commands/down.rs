//! `gridctl down` — stop every node and remove the fabric.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use crate::bootstrap::{self, Topology};

pub async fn down(path: &Path, docker: &Path, purge: bool) -> anyhow::Result<()> {
    let topology = Topology::load(path)?;
    let name = topology.spec.name.clone();
    let controller = bootstrap::connect(topology.spec, docker).await?;

    info!(cluster = %name, purge, "tearing cluster down");
    controller
        .teardown(purge)
        .await
        .with_context(|| format!("failed to tear down cluster {name}"))?;

    println!("✓ Cluster {name} is down");
    Ok(())
}
