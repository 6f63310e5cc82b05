//! nodegrid-health — reachability probing for cluster nodes.
//!
//! # Architecture
//!
//! ```text
//! Prober (trait)
//!   ├── TcpProber  — connect to the node's control port
//!   └── HttpProber — GET a path on the node's UI port, 2xx is healthy
//! HealthTracker
//!   └── consecutive failures → Unhealthy at the threshold (default 3)
//! ```
//!
//! The lifecycle controller owns one `HealthTracker` per running node and
//! turns an `Unhealthy` verdict into `Running -> Unreachable`.

pub mod checker;
pub mod probe;

pub use checker::{HealthStatus, HealthTracker, ProbeResult};
pub use probe::{HttpProber, ProbeTarget, Prober, TcpProber, prober_for};
