//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API request/response error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// API discovery failed as a whole
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The requested resource kind is not served by the API server
    #[error("Resource kind not installed: {0}")]
    KindNotInstalled(String),

    /// Watch stream reported an error
    #[error("Watch error: {0}")]
    Watch(String),

    /// Object returned by the API is missing required fields
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server could not be reached
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl ClusterError {
    /// Returns true if the error means the kind is absent rather than the call failing.
    #[must_use]
    pub fn is_kind_not_installed(&self) -> bool {
        matches!(self, ClusterError::KindNotInstalled(_))
    }
}
