//! `gridctl init` — write a starter topology document.

use std::path::Path;

use anyhow::{Context, bail};
use tracing::info;

use nodegrid_core::TopologyDocument;

pub fn init(path: &Path, name: &str, image: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let doc = TopologyDocument::scaffold(name, image);
    // Refuse to write something `up` would reject.
    doc.validate()
        .with_context(|| format!("cannot scaffold cluster {name:?}"))?;
    doc.save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    info!(cluster = %name, path = %path.display(), "topology written");
    println!("✓ Generated {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_valid_two_worker_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodegrid.toml");
        init(&path, "spark", "bitnami/spark:3.5", false).unwrap();

        let spec = TopologyDocument::from_file(&path).unwrap().validate().unwrap();
        assert_eq!(spec.name, "spark");
        assert_eq!(spec.workers.len(), 2);
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodegrid.toml");
        std::fs::write(&path, "# mine").unwrap();

        assert!(init(&path, "spark", "img", false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");

        init(&path, "spark", "img", true).unwrap();
        assert!(TopologyDocument::from_file(&path).is_ok());
    }

    #[test]
    fn invalid_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodegrid.toml");
        assert!(init(&path, "", "img", false).is_err());
        assert!(!path.exists());
    }
}
