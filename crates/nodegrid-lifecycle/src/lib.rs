//! nodegrid-lifecycle — node state machine, ordered startup, and teardown.
//!
//! # Architecture
//!
//! ```text
//! LifecycleController
//!   ├── NodeTable ──publish──▶ watch<Arc<ClusterSnapshot>>
//!   ├── NodeRuntime (launch / terminate / kill / remove / inspect)
//!   │   ├── DockerRuntime (docker CLI, labelled containers)
//!   │   └── MemoryRuntime (in-process, with failure injection)
//!   ├── Prober + HealthTracker per node (nodegrid-health)
//!   ├── FabricManager (nodegrid-fabric)
//!   └── RetryPolicy (exponential backoff with jitter)
//! ```
//!
//! The coordinator always starts before any worker. Workers wait for the
//! coordinator's control endpoint, bounded by the readiness timeout.

pub mod controller;
pub mod docker;
pub mod error;
pub mod memory;
pub mod retry;
pub mod runtime;
pub mod table;

pub use controller::LifecycleController;
pub use docker::DockerRuntime;
pub use error::{ClusterError, ClusterResult, RuntimeError};
pub use memory::MemoryRuntime;
pub use retry::RetryPolicy;
pub use runtime::{LaunchPlan, NodeRuntime, ObservedNode, PortMapping};
pub use table::{ClusterSnapshot, NodeState, NodeTable, NodeTemplate};
