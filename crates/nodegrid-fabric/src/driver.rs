//! Network drivers — the backends that actually create virtual networks.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use nodegrid_core::Subnet;

use crate::docker::DockerCli;
use crate::error::{FabricError, FabricResult};

/// Creates and removes isolated virtual networks.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Whether a network with this name already exists.
    async fn exists(&self, name: &str) -> FabricResult<bool>;

    /// Create a network with the given subnet and labels.
    async fn create(
        &self,
        name: &str,
        subnet: &Subnet,
        labels: &BTreeMap<String, String>,
    ) -> FabricResult<()>;

    /// Remove a network. Removing a missing network is not an error.
    async fn remove(&self, name: &str) -> FabricResult<()>;
}

// ── Docker ────────────────────────────────────────────────────────

/// Bridge networks managed through the docker CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerNetworkDriver {
    docker: DockerCli,
}

impl DockerNetworkDriver {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl NetworkDriver for DockerNetworkDriver {
    async fn exists(&self, name: &str) -> FabricResult<bool> {
        let filter = format!("name=^{name}$");
        let out = self
            .docker
            .run(["network", "ls", "--filter", filter.as_str(), "--format", "{{.Name}}"])
            .await?;
        Ok(out.lines().any(|line| line.trim() == name))
    }

    async fn create(
        &self,
        name: &str,
        subnet: &Subnet,
        labels: &BTreeMap<String, String>,
    ) -> FabricResult<()> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            "bridge".to_string(),
            "--subnet".to_string(),
            subnet.to_string(),
            "--gateway".to_string(),
            subnet.gateway().to_string(),
        ];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(name.to_string());

        self.docker.run(&args).await?;
        info!(network = %name, %subnet, "docker network created");
        Ok(())
    }

    async fn remove(&self, name: &str) -> FabricResult<()> {
        match self.docker.run(["network", "rm", name]).await {
            Ok(_) => {
                info!(network = %name, "docker network removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(network = %name, "docker network already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── In-memory ─────────────────────────────────────────────────────

/// In-process network driver for tests.
///
/// Tracks network names in memory and can be told to fail creation.
#[derive(Debug, Default)]
pub struct MemoryNetworkDriver {
    networks: Mutex<HashSet<String>>,
    fail_create: AtomicBool,
    creates: AtomicU32,
}

impl MemoryNetworkDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `create` calls.
    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .networks
            .lock()
            .map(|n| n.iter().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[async_trait]
impl NetworkDriver for MemoryNetworkDriver {
    async fn exists(&self, name: &str) -> FabricResult<bool> {
        let networks = self
            .networks
            .lock()
            .map_err(|e| FabricError::Driver(e.to_string()))?;
        Ok(networks.contains(name))
    }

    async fn create(
        &self,
        name: &str,
        _subnet: &Subnet,
        _labels: &BTreeMap<String, String>,
    ) -> FabricResult<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(FabricError::Driver(format!("cannot create network {name}")));
        }
        self.networks
            .lock()
            .map_err(|e| FabricError::Driver(e.to_string()))?
            .insert(name.to_string());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, name: &str) -> FabricResult<()> {
        self.networks
            .lock()
            .map_err(|e| FabricError::Driver(e.to_string()))?
            .remove(name);
        Ok(())
    }
}
