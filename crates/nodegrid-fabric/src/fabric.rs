//! Fabric manager — owns the cluster network and its address table.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use nodegrid_core::Subnet;

use crate::driver::NetworkDriver;
use crate::error::{FabricError, FabricResult};

/// Handle to a created fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FabricHandle {
    pub name: String,
    pub subnet: Subnet,
    pub gateway: Ipv4Addr,
}

/// Address table of a live fabric.
struct FabricState {
    handle: FabricHandle,
    /// node → host index within the subnet.
    attached: BTreeMap<String, u32>,
    taken: BTreeSet<u32>,
}

impl FabricState {
    fn lowest_free_index(&self) -> u32 {
        let mut index = 0;
        for taken in &self.taken {
            if *taken != index {
                break;
            }
            index += 1;
        }
        index
    }
}

/// Manages one isolated virtual network and allocates node addresses
/// on it.
///
/// The fabric lives for the whole cluster lifetime and is torn down last.
pub struct FabricManager {
    driver: Arc<dyn NetworkDriver>,
    name: String,
    subnet: Subnet,
    labels: BTreeMap<String, String>,
    state: Mutex<Option<FabricState>>,
}

impl FabricManager {
    pub fn new(driver: Arc<dyn NetworkDriver>, name: &str, subnet: Subnet) -> Self {
        Self {
            driver,
            name: name.to_string(),
            subnet,
            labels: BTreeMap::new(),
            state: Mutex::new(None),
        }
    }

    /// Attach labels passed to the driver at creation time.
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the fabric, or return the handle of the existing one.
    ///
    /// A network left behind by an earlier run is adopted rather than
    /// recreated.
    pub async fn create_fabric(&self) -> FabricResult<FabricHandle> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.as_ref() {
            debug!(network = %self.name, "fabric already created");
            return Ok(existing.handle.clone());
        }

        if self.driver.exists(&self.name).await? {
            info!(network = %self.name, "adopting existing fabric");
        } else {
            self.driver
                .create(&self.name, &self.subnet, &self.labels)
                .await?;
            info!(network = %self.name, subnet = %self.subnet, "fabric created");
        }

        let handle = FabricHandle {
            name: self.name.clone(),
            subnet: self.subnet,
            gateway: self.subnet.gateway(),
        };
        *state = Some(FabricState {
            handle: handle.clone(),
            attached: BTreeMap::new(),
            taken: BTreeSet::new(),
        });
        Ok(handle)
    }

    /// Attach a node and return its address.
    ///
    /// Attaching an already attached node returns its current address.
    pub async fn attach(&self, node: &str) -> FabricResult<Ipv4Addr> {
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| FabricError::NotCreated(self.name.clone()))?;

        if let Some(index) = state.attached.get(node) {
            return self.address(*index);
        }

        let index = state.lowest_free_index();
        let address = self.subnet.host(index).ok_or_else(|| FabricError::Exhausted {
            network: self.name.clone(),
        })?;

        state.attached.insert(node.to_string(), index);
        state.taken.insert(index);
        debug!(%node, %address, network = %self.name, "node attached");
        Ok(address)
    }

    /// Attach a node at a specific address, e.g. one recovered from the
    /// container runtime after a restart.
    pub async fn attach_at(&self, node: &str, address: Ipv4Addr) -> FabricResult<Ipv4Addr> {
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| FabricError::NotCreated(self.name.clone()))?;

        let index = self.index_of(address)?;
        if let Some((owner, _)) = state
            .attached
            .iter()
            .find(|(owner, i)| **i == index && owner.as_str() != node)
        {
            return Err(FabricError::AddressTaken {
                address: address.to_string(),
                owner: owner.clone(),
            });
        }

        if let Some(previous) = state.attached.insert(node.to_string(), index)
            && previous != index
        {
            state.taken.remove(&previous);
        }
        state.taken.insert(index);
        debug!(%node, %address, network = %self.name, "node attached at fixed address");
        Ok(address)
    }

    /// Release a node's address. Unknown nodes are ignored.
    pub async fn detach(&self, node: &str) {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.as_mut()
            && let Some(index) = state.attached.remove(node)
        {
            state.taken.remove(&index);
            debug!(%node, network = %self.name, "node detached");
        }
    }

    /// Remove the fabric.
    ///
    /// Fails with [`FabricError::NodesAttached`] while any node is still
    /// attached. Tearing down a fabric that does not exist is a no-op.
    pub async fn teardown(&self) -> FabricResult<()> {
        let mut guard = self.state.lock().await;
        match guard.as_ref() {
            None => {
                debug!(network = %self.name, "no fabric to tear down");
                Ok(())
            }
            Some(state) if !state.attached.is_empty() => {
                let nodes: Vec<String> = state.attached.keys().cloned().collect();
                warn!(network = %self.name, attached = nodes.len(), "fabric teardown refused");
                Err(FabricError::NodesAttached {
                    network: self.name.clone(),
                    nodes,
                })
            }
            Some(_) => {
                self.driver.remove(&self.name).await?;
                *guard = None;
                info!(network = %self.name, "fabric torn down");
                Ok(())
            }
        }
    }

    /// Remove a network left behind by an earlier run that this manager
    /// never created in-process.
    pub async fn remove_orphan(&self) -> FabricResult<()> {
        let guard = self.state.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        self.driver.remove(&self.name).await
    }

    pub async fn handle(&self) -> Option<FabricHandle> {
        self.state.lock().await.as_ref().map(|s| s.handle.clone())
    }

    /// Names of all attached nodes, sorted.
    pub async fn attached_nodes(&self) -> Vec<String> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|s| s.attached.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn address(&self, index: u32) -> FabricResult<Ipv4Addr> {
        self.subnet.host(index).ok_or_else(|| FabricError::Exhausted {
            network: self.name.clone(),
        })
    }

    fn index_of(&self, address: Ipv4Addr) -> FabricResult<u32> {
        let first = u32::from(self.subnet.network) + 2;
        let raw = u32::from(address);
        if !self.subnet.contains(address) || raw < first {
            return Err(FabricError::OutOfRange {
                network: self.name.clone(),
                address: address.to_string(),
            });
        }
        let index = raw - first;
        if index >= self.subnet.assignable_hosts() {
            return Err(FabricError::OutOfRange {
                network: self.name.clone(),
                address: address.to_string(),
            });
        }
        Ok(index)
    }
}
