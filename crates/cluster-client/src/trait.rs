//! ClusterClient trait for mocking
//!
//! The agent depends only on these four capabilities. The kube-backed
//! `KubeClusterClient` implements them for real clusters and
//! `MockClusterClient` (feature `test-util`) implements them in memory.

use crate::error::ClusterError;
use crate::models::{InstalledKinds, ListOptions, NodeStatus, ResourceInstance, ResourceKind, WatchStream};

/// Trait for Kubernetes API operations used by the classifier agent
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    /// Enumerates the resource kinds currently served by the API server.
    ///
    /// Group/versions that cannot be enumerated are reported in
    /// `InstalledKinds::unreachable` instead of failing the whole pass.
    async fn list_installed_kinds(&self) -> Result<InstalledKinds, ClusterError>;

    /// Lists instances of a kind.
    ///
    /// Returns `ClusterError::KindNotInstalled` when the kind is not served.
    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<ResourceInstance>, ClusterError>;

    /// Opens a watch on every instance of a kind.
    ///
    /// Dropping the returned stream releases the subscription.
    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, ClusterError>;

    /// Reads a node's status. Returns `None` if the node does not exist.
    async fn get_node_status(&self, name: &str) -> Result<Option<NodeStatus>, ClusterError>;
}
