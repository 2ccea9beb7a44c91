//! Classifier CRD Definitions
//!
//! Kubernetes Custom Resource Definitions consumed by the classifier agent.

pub mod classifier;

pub use classifier::*;
