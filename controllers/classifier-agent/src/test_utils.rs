//! Test utilities for unit testing the agent
//!
//! This module provides an in-memory classifier source, a cluster client
//! whose calls can be held mid-flight, and helpers for building classifiers.

#[cfg(test)]
use crate::classifier_source::ClassifierSource;
#[cfg(test)]
use crate::error::ControllerError;
#[cfg(test)]
use cluster_client::{
    ClusterClientTrait, ClusterError, InstalledKinds, ListOptions, MockClusterClient, NodeStatus, ResourceInstance,
    ResourceKind, WatchStream,
};
#[cfg(test)]
use crds::*;
#[cfg(test)]
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use tokio::sync::Notify;

/// Holds the next call that passes through it until released
#[cfg(test)]
#[derive(Debug, Default)]
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[cfg(test)]
impl Gate {
    /// Hold the next call only
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Called by the gated operation
    pub async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    /// Waits until a call is held at the gate
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Lets the held call continue
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// Mock client whose `watch` and `list` calls can be held
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct GatedClient {
    pub mock: MockClusterClient,
    /// Held before the subscription is opened
    pub watch_gate: Arc<Gate>,
    /// Held after the instances were read
    pub list_gate: Arc<Gate>,
}

#[cfg(test)]
impl GatedClient {
    pub fn new(mock: MockClusterClient) -> Self {
        Self {
            mock,
            ..Default::default()
        }
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ClusterClientTrait for GatedClient {
    async fn list_installed_kinds(&self) -> Result<InstalledKinds, ClusterError> {
        self.mock.list_installed_kinds().await
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<ResourceInstance>, ClusterError> {
        let instances = self.mock.list(kind, options).await;
        self.list_gate.pass().await;
        instances
    }

    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, ClusterError> {
        self.watch_gate.pass().await;
        self.mock.watch(kind).await
    }

    async fn get_node_status(&self, name: &str) -> Result<Option<NodeStatus>, ClusterError> {
        self.mock.get_node_status(name).await
    }
}

/// In-memory classifier source
#[cfg(test)]
#[derive(Default)]
pub struct StaticClassifierSource {
    classifiers: Mutex<Vec<Classifier>>,
    failure: Mutex<Option<String>>,
    /// Held after the classifiers were read
    pub gate: Gate,
}

#[cfg(test)]
impl StaticClassifierSource {
    pub fn new(classifiers: Vec<Classifier>) -> Self {
        Self {
            classifiers: Mutex::new(classifiers),
            ..Default::default()
        }
    }

    /// Replace the served classifiers
    pub fn set(&self, classifiers: Vec<Classifier>) {
        *self.classifiers.lock().unwrap() = classifiers;
    }

    /// Make listing fail with the given message
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make listing succeed again
    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl ClassifierSource for StaticClassifierSource {
    async fn list_classifiers(&self) -> Result<Vec<Classifier>, ControllerError> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(ControllerError::List(message));
        }
        let classifiers = self.classifiers.lock().unwrap().clone();
        self.gate.pass().await;
        Ok(classifiers)
    }
}

#[cfg(test)]
pub fn pod_kind() -> ResourceKind {
    ResourceKind::new("", "v1", "Pod")
}

/// Helper to create a test Classifier
#[cfg(test)]
pub fn create_test_classifier(name: &str, spec: ClassifierSpec) -> Classifier {
    Classifier {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec,
    }
}

/// Classifier requiring at least one instance of each kind
#[cfg(test)]
pub fn classifier_with_resources(name: &str, kinds: Vec<ResourceKind>) -> Classifier {
    create_test_classifier(
        name,
        ClassifierSpec {
            deployed_resource_constraints: kinds
                .iter()
                .map(|k| DeployedResourceConstraint::new(&k.group, &k.version, &k.kind))
                .collect(),
            classifier_labels: vec![ClassifierLabel {
                key: "classifier".to_string(),
                value: name.to_string(),
            }],
            ..Default::default()
        },
    )
}

/// Classifier with a single version constraint
#[cfg(test)]
pub fn classifier_with_version(name: &str, comparison: ComparisonOperator, version: &str) -> Classifier {
    create_test_classifier(
        name,
        ClassifierSpec {
            kubernetes_version_constraints: vec![KubernetesVersionConstraint {
                version: version.to_string(),
                comparison,
            }],
            classifier_labels: vec![ClassifierLabel {
                key: "k8s".to_string(),
                value: name.to_string(),
            }],
            ..Default::default()
        },
    )
}

/// Node status as the cluster client reports it
#[cfg(test)]
pub fn node_status(name: &str, kubelet_version: &str, control_plane: bool) -> NodeStatus {
    NodeStatus {
        name: name.to_string(),
        kubelet_version: Some(kubelet_version.to_string()),
        control_plane,
        generation: None,
    }
}
