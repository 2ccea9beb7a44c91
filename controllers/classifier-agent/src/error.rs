//! Controller-specific error types.
//!
//! This module defines the error taxonomy of the classifier agent. Discovery,
//! watch and constraint errors are absorbed where they occur; only `List`
//! (and client errors raised while listing) travel up to the control loop,
//! which requeues with backoff.

use cluster_client::{ClusterError, ResourceKind};
use thiserror::Error;

/// Errors that can occur in the classifier agent.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Cluster client error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Resource kind discovery failed; retried on the next tick
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Failed to open a watch for an installed kind; kind stays pending
    #[error("Failed to watch {kind}: {reason}")]
    Watch {
        /// Kind the watch was opened for
        kind: ResourceKind,
        /// Underlying failure
        reason: String,
    },

    /// Malformed version or selector in a classifier; evaluated as non-match
    #[error("Classifier {classifier}: cannot evaluate constraint: {reason}")]
    ConstraintEvaluation {
        /// Classifier name
        classifier: String,
        /// What was malformed
        reason: String,
    },

    /// Failed to enumerate classifiers or read node status
    #[error("List failed: {0}")]
    List(String),

    /// Manager used before `initialize`
    #[error("Watch manager is not initialized")]
    NotInitialized,

    /// A background task exited unexpectedly
    #[error("Task failed: {0}")]
    Task(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O error (metrics listener)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
