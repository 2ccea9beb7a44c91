//! Classifier Agent
//!
//! Runs inside a managed cluster and classifies it against Classifier
//! resources:
//! - Watch manager: keeps one watch open per resource kind a classifier
//!   references, deferring kinds whose CRDs are not installed yet
//! - Evaluator: decides per classifier whether its constraints hold
//! - Node reconciler: derives the Kubernetes version from the nodes and
//!   re-evaluates version-constrained classifiers when it changes

pub mod backoff;
pub mod classifier_source;
pub mod config;
pub mod controller;
pub mod error;
pub mod evaluator;
pub mod manager;
pub mod metrics;
pub mod node_reconciler;
pub mod version;
pub mod watcher;

mod test_utils;

pub use controller::Controller;
pub use error::ControllerError;
