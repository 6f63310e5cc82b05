//! nodegrid-core — topology document and domain types.
//!
//! The topology document (`nodegrid.toml`) declares one coordinator, an
//! ordered list of workers, shared read-only mounts, and the health,
//! lifecycle, and retry policies. [`TopologyDocument::validate`] turns it
//! into an immutable [`ClusterSpec`] or a [`ConfigError`] naming the
//! offending field.

pub mod error;
pub mod topology;
pub mod types;
pub mod units;

pub use error::{ConfigError, ConfigResult};
pub use topology::TopologyDocument;
pub use types::*;
