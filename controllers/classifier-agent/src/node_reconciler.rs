//! Node version reconciler.
//!
//! Tracks the kubelet versions of the cluster's nodes and derives the
//! platform version from them. When that version changes, classifiers with
//! a version constraint whose membership flips are queued for re-evaluation.

use crate::backoff::FibonacciBackoff;
use crate::classifier_source::ClassifierSource;
use crate::error::ControllerError;
use crate::evaluator::Evaluator;
use crate::metrics::Metrics;
use crate::version::KubeVersion;
use cluster_client::{ClusterClientTrait, NodeStatus};
use crds::Classifier;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the reconciler last saw of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFacts {
    /// Node name
    pub name: String,
    /// Kubelet version
    pub version: Option<String>,
    /// Last observed `metadata.generation`
    pub generation: Option<i64>,
    /// Whether the node is part of the control plane
    pub control_plane: bool,
}

impl From<NodeStatus> for NodeFacts {
    fn from(status: NodeStatus) -> Self {
        Self {
            name: status.name,
            version: status.kubelet_version,
            generation: status.generation,
            control_plane: status.control_plane,
        }
    }
}

/// Lowest parseable kubelet version among control-plane nodes, or among all
/// nodes when no control-plane node is known. Nodes reporting the same
/// version in different spellings resolve to the one with the lowest name.
#[must_use]
pub fn effective_version<'a>(nodes: impl IntoIterator<Item = &'a NodeFacts> + Clone) -> Option<String> {
    let lowest = |control_plane_only: bool| {
        nodes
            .clone()
            .into_iter()
            .filter(|facts| !control_plane_only || facts.control_plane)
            .filter_map(|facts| {
                let raw = facts.version.as_deref()?;
                raw.parse::<KubeVersion>()
                    .ok()
                    .map(|parsed| (parsed, facts.name.as_str(), raw))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .map(|(_, _, raw)| raw.to_string())
    };
    let has_control_plane = nodes.clone().into_iter().any(|facts| facts.control_plane);
    lowest(has_control_plane)
}

#[derive(Debug, Default)]
struct ReconcilerState {
    nodes: HashMap<String, NodeFacts>,
    /// Platform version last applied to the evaluator
    kubernetes_version: Option<String>,
    backoff_states: HashMap<String, FibonacciBackoff>,
}

/// Reconciles nodes into the platform version.
pub struct NodeReconciler {
    client: Arc<dyn ClusterClientTrait>,
    source: Arc<dyn ClassifierSource>,
    evaluator: Arc<Evaluator>,
    state: Mutex<ReconcilerState>,
    /// Serializes comparing, listing and applying the platform version
    apply: tokio::sync::Mutex<()>,
    triggers: mpsc::UnboundedSender<Classifier>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for NodeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeReconciler").finish_non_exhaustive()
    }
}

impl NodeReconciler {
    /// Creates a reconciler queueing classifiers to re-evaluate on `triggers`.
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        source: Arc<dyn ClassifierSource>,
        evaluator: Arc<Evaluator>,
        triggers: mpsc::UnboundedSender<Classifier>,
    ) -> Self {
        Self {
            client,
            source,
            evaluator,
            state: Mutex::new(ReconcilerState::default()),
            apply: tokio::sync::Mutex::new(()),
            triggers,
            metrics: None,
        }
    }

    /// Count reconciliations in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn state(&self) -> MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Platform version currently in effect
    #[must_use]
    pub fn kubernetes_version(&self) -> Option<String> {
        self.state().kubernetes_version.clone()
    }

    /// Overrides the platform version without re-evaluating anything.
    pub fn set_kubernetes_version(&self, version: Option<String>) {
        self.state().kubernetes_version = version.clone();
        self.evaluator.set_platform_version(version);
    }

    /// Cached facts for a node
    #[must_use]
    pub fn node_facts(&self, name: &str) -> Option<NodeFacts> {
        self.state().nodes.get(name).cloned()
    }

    /// Classifiers with at least one version constraint.
    pub async fn find_classifier_using_kubernetes_version(&self) -> Result<Vec<Classifier>, ControllerError> {
        let classifiers = self.source.list_classifiers().await?;
        Ok(classifiers
            .into_iter()
            .filter(|c| c.spec.uses_kubernetes_version())
            .collect())
    }

    /// Reconciles one node for the control loop.
    pub async fn reconcile(&self, name: &str) -> Result<Action, ControllerError> {
        self.reconcile_node(name).await?;
        if let Some(backoff) = self.state().backoff_states.get_mut(name) {
            backoff.reset();
        }
        Ok(Action::await_change())
    }

    /// Reconciles one node and returns the classifiers queued for
    /// re-evaluation.
    pub async fn reconcile_node(&self, name: &str) -> Result<Vec<String>, ControllerError> {
        if let Some(metrics) = &self.metrics {
            metrics.node_reconciliations.inc();
        }
        let status = self.client.get_node_status(name).await?;

        {
            let mut state = self.state();
            match status {
                Some(status) => {
                    let facts = NodeFacts::from(status);
                    if state.nodes.get(name) != Some(&facts) {
                        debug!("Node {} reports kubelet {:?}", name, facts.version);
                        state.nodes.insert(name.to_string(), facts);
                    }
                }
                None => {
                    if state.nodes.remove(name).is_some() {
                        debug!("Node {} is gone", name);
                    }
                    state.backoff_states.remove(name);
                }
            }
        }

        // Held until the version is applied so concurrent node reconciles
        // compare against the cache as the previous one left it
        let _apply = self.apply.lock().await;
        let (effective, applied) = {
            let state = self.state();
            (effective_version(state.nodes.values()), state.kubernetes_version.clone())
        };
        if effective == applied {
            return Ok(Vec::new());
        }
        info!("Platform version changed from {:?} to {:?}", applied, effective);

        // On error the version is not applied, so a retry sees the change again
        let classifiers = self.find_classifier_using_kubernetes_version().await?;
        let flipped: Vec<Classifier> = classifiers
            .into_iter()
            .filter(|classifier| {
                let before = self.evaluator.version_membership(classifier, applied.as_deref());
                let after = self.evaluator.version_membership(classifier, effective.as_deref());
                if before != after {
                    debug!("Classifier {} version membership: {} -> {}", classifier.name_any(), before, after);
                }
                before != after
            })
            .collect();

        // Re-evaluation reads the platform version from the evaluator
        self.set_kubernetes_version(effective);

        let mut queued = Vec::with_capacity(flipped.len());
        for classifier in flipped {
            let name = classifier.name_any();
            if self.triggers.send(classifier).is_err() {
                warn!("No receiver for re-evaluation of classifier {}", name);
            }
            queued.push(name);
        }
        Ok(queued)
    }

    /// Requeue delay for a failed reconciliation of `name`.
    pub fn error_policy(&self, name: &str, error: &ControllerError) -> Action {
        let delay = self
            .state()
            .backoff_states
            .entry(name.to_string())
            .or_default()
            .next_backoff();
        warn!("Reconciliation of node {} failed, retrying in {:?}: {}", name, delay, error);
        Action::requeue(delay)
    }
}

#[cfg(test)]
#[path = "node_reconciler_test.rs"]
mod node_reconciler_test;
