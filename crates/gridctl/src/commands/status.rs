//! `gridctl status` — print node state and endpoints.

use std::path::Path;

use anyhow::bail;

use nodegrid_status::{StatusReport, StatusReporter};

use crate::bootstrap::{self, Topology};

pub async fn status(path: &Path, docker: &Path, format: &str) -> anyhow::Result<()> {
    let topology = Topology::load(path)?;
    let spec = topology.spec.clone();
    let controller = bootstrap::connect(topology.spec, docker).await?;

    let report = StatusReporter::new(controller.subscribe(), &spec).report();
    print!("{}", render(&report, format)?);
    Ok(())
}

fn render(report: &StatusReport, format: &str) -> anyhow::Result<String> {
    match format {
        "text" => Ok(report.render_table()),
        "json" => Ok(format!("{}\n", report.to_json()?)),
        other => bail!("unknown format {other:?} (expected text or json)"),
    }
}
