//! Kubernetes Cluster Client
//!
//! Capability layer between the classifier agent and the Kubernetes API:
//! discovery of installed resource kinds, listing and watching instances of
//! kinds only known at runtime, and reading node status.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient, ListOptions, ResourceKind};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::try_default().await?;
//!
//! let installed = client.list_installed_kinds().await?;
//! let pods = ResourceKind::new("", "v1", "Pod");
//! if installed.kinds.contains(&pods) {
//!     let items = client.list(&pods, &ListOptions::default()).await?;
//!     println!("{} pods", items.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClientTrait;
pub use error::ClusterError;
pub use models::*;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockClusterClient;
