//! Topology configuration errors.

use thiserror::Error;

/// Result type alias for topology loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// An invalid topology. Always fatal: nothing is launched once one of
/// these is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read topology {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse topology: {0}")]
    Parse(String),

    #[error("{field}: duplicate name {value:?}")]
    DuplicateName { field: String, value: String },

    #[error("{field}: port {port} already used by {other}")]
    PortCollision {
        field: String,
        port: u16,
        other: String,
    },

    #[error("{field}: must be positive, got {value}")]
    NonPositive { field: String, value: String },

    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    /// The document field this error refers to, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::DuplicateName { field, .. }
            | ConfigError::PortCollision { field, .. }
            | ConfigError::NonPositive { field, .. }
            | ConfigError::Invalid { field, .. } => Some(field),
            ConfigError::Read { .. } | ConfigError::Parse(_) => None,
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
