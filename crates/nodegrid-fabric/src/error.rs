//! Fabric error types.

use thiserror::Error;

use crate::docker::DockerError;

/// Errors from network creation, address allocation, and teardown.
///
/// Fatal to the operation that produced them; they never cascade to
/// nodes that were not part of that operation.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("fabric {0} has not been created")]
    NotCreated(String),

    #[error("fabric {network} still has attached nodes: {}", nodes.join(", "))]
    NodesAttached { network: String, nodes: Vec<String> },

    #[error("fabric {network} has no free addresses")]
    Exhausted { network: String },

    #[error("address {address} is outside fabric {network}")]
    OutOfRange { network: String, address: String },

    #[error("address {address} is already assigned to {owner}")]
    AddressTaken { address: String, owner: String },

    #[error("network driver error: {0}")]
    Driver(String),

    #[error(transparent)]
    Docker(#[from] DockerError),
}

pub type FabricResult<T> = Result<T, FabricError>;
