//! Lifecycle error types.

use std::time::Duration;

use thiserror::Error;

use nodegrid_fabric::{DockerError, FabricError};

/// Errors raised by a [`NodeRuntime`](crate::runtime::NodeRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error("{0}")]
    Other(String),
}

/// Errors that can occur while driving the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("failed to launch {node}: {source}")]
    Launch {
        node: String,
        #[source]
        source: RuntimeError,
    },

    #[error("{node} is unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("{node} failed after {attempts} restart attempts")]
    NodeFailed { node: String, attempts: u32 },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("operation cancelled by teardown")]
    Cancelled,

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

impl ClusterError {
    /// Whether the retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::Launch { .. } | ClusterError::Unreachable { .. } | ClusterError::Timeout { .. }
        )
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        let launch = ClusterError::Launch {
            node: "worker-1".to_string(),
            source: RuntimeError::Other("boom".to_string()),
        };
        assert!(launch.is_retryable());
        assert!(
            ClusterError::Timeout {
                what: "coordinator".to_string(),
                after: Duration::from_secs(1),
            }
            .is_retryable()
        );
        assert!(
            ClusterError::Unreachable {
                node: "worker-1".to_string(),
                reason: "refused".to_string(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn terminal_failures_are_not_retryable() {
        assert!(!ClusterError::Cancelled.is_retryable());
        assert!(!ClusterError::UnknownNode("x".to_string()).is_retryable());
        assert!(
            !ClusterError::NodeFailed {
                node: "worker-1".to_string(),
                attempts: 5,
            }
            .is_retryable()
        );
        let fabric = ClusterError::from(FabricError::NotCreated("net".to_string()));
        assert!(!fabric.is_retryable());
    }

    #[test]
    fn launch_error_names_the_node() {
        let err = ClusterError::Launch {
            node: "worker-2".to_string(),
            source: RuntimeError::Other("image missing".to_string()),
        };
        assert_eq!(err.to_string(), "failed to launch worker-2: image missing");
    }
}
