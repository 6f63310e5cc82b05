//! nodegrid-fabric — the isolated virtual network connecting all nodes.
//!
//! # Architecture
//!
//! ```text
//! FabricManager
//!   ├── NetworkDriver (create / exists / remove the network)
//!   │   ├── DockerNetworkDriver (docker CLI, bridge network)
//!   │   └── MemoryNetworkDriver (in-process, for tests)
//!   └── Address table (node → Ipv4Addr, allocated from .2 upward)
//! ```
//!
//! Creating a fabric that already exists returns the existing handle.
//! Tearing down a fabric with nodes still attached fails; callers stop
//! and detach nodes first.

pub mod docker;
pub mod driver;
pub mod error;
pub mod fabric;

pub use docker::{DockerCli, DockerError};
pub use driver::{DockerNetworkDriver, MemoryNetworkDriver, NetworkDriver};
pub use error::{FabricError, FabricResult};
pub use fabric::{FabricHandle, FabricManager};
