//! Classification evaluator.
//!
//! Decides per classifier whether every constraint holds, and reports
//! changes of that decision. Evaluation fails closed: a constraint that
//! cannot be evaluated counts as not satisfied.

use crate::error::ControllerError;
use crate::manager::resource_kind_of;
use crate::metrics::Metrics;
use crate::version::{compare, KubeVersion};
use cluster_client::{ClusterClientTrait, LabelSelector, ListOptions, ResourceInstance};
use crds::{Classifier, ClassifierSpec, DeployedResourceConstraint, FieldFilter, SelectorOperation};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of evaluating one classifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    /// Classifier name
    pub classifier: String,
    /// Whether every constraint holds
    pub is_match: bool,
    /// Labels the classifier applies on match
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct EvaluatorState {
    platform_version: Option<String>,
    results: HashMap<String, ClassificationResult>,
    /// Classifiers whose constraint error was already logged
    warned: HashSet<String>,
}

/// Classification evaluator.
pub struct Evaluator {
    client: Arc<dyn ClusterClientTrait>,
    state: Mutex<EvaluatorState>,
    /// One lock per classifier, held from reading the cluster to recording
    /// the result
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    results: mpsc::UnboundedSender<ClassificationResult>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Creates an evaluator sending match transitions to `results`.
    pub fn new(client: Arc<dyn ClusterClientTrait>, results: mpsc::UnboundedSender<ClassificationResult>) -> Self {
        Self {
            client,
            state: Mutex::new(EvaluatorState::default()),
            in_flight: Mutex::new(HashMap::new()),
            results,
            metrics: None,
        }
    }

    /// Count evaluations and matches in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn state(&self) -> MutexGuard<'_, EvaluatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the platform version used for version constraints.
    pub fn set_platform_version(&self, version: Option<String>) {
        self.state().platform_version = version;
    }

    /// Platform version currently used
    #[must_use]
    pub fn platform_version(&self) -> Option<String> {
        self.state().platform_version.clone()
    }

    /// Checks the version constraints of `spec` against `version`.
    ///
    /// No constraints always matches. An unknown platform version matches
    /// nothing that has constraints. Malformed versions on either side are
    /// errors.
    pub fn is_version_match(
        classifier: &str,
        spec: &ClassifierSpec,
        version: Option<&str>,
    ) -> Result<bool, ControllerError> {
        if spec.kubernetes_version_constraints.is_empty() {
            return Ok(true);
        }
        let Some(version) = version else {
            return Ok(false);
        };
        let current: KubeVersion = version.parse().map_err(|e| ControllerError::ConstraintEvaluation {
            classifier: classifier.to_string(),
            reason: format!("platform version: {e}"),
        })?;

        for constraint in &spec.kubernetes_version_constraints {
            let wanted: KubeVersion = constraint.version.parse().map_err(|e| ControllerError::ConstraintEvaluation {
                classifier: classifier.to_string(),
                reason: format!("constraint version: {e}"),
            })?;
            if !compare(current, constraint.comparison, wanted) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Version membership of `classifier` for `version`; errors count as
    /// non-match and are logged once per classifier.
    pub fn version_membership(&self, classifier: &Classifier, version: Option<&str>) -> bool {
        let name = classifier.name_any();
        match Self::is_version_match(&name, &classifier.spec, version) {
            Ok(matched) => matched,
            Err(e) => {
                self.warn_once(&name, &e);
                false
            }
        }
    }

    /// Checks one resource constraint against the instances in the cluster.
    ///
    /// A kind that is not installed is a non-match, not an error.
    pub async fn is_resource_match(&self, constraint: &DeployedResourceConstraint) -> Result<bool, ControllerError> {
        let kind = resource_kind_of(constraint);
        let mut selector = LabelSelector::new();
        for filter in &constraint.label_filters {
            selector = match filter.operation {
                SelectorOperation::Equal => selector.equal(&filter.key, &filter.value),
                SelectorOperation::Different => selector.not_equal(&filter.key, &filter.value),
            };
        }
        let options = ListOptions {
            namespace: constraint.namespace.clone(),
            label_selector: selector,
        };

        let instances = match self.client.list(&kind, &options).await {
            Ok(instances) => instances,
            Err(e) if e.is_kind_not_installed() => {
                debug!("{} is not installed, constraint not met", kind);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let count = instances
            .iter()
            .filter(|instance| constraint.field_filters.iter().all(|f| field_matches(instance, f)))
            .count();
        let min = constraint.min_count.unwrap_or(1) as usize;
        let within_max = constraint.max_count.is_none_or(|max| count <= max as usize);
        Ok(count >= min && within_max)
    }

    /// Whether every constraint of `classifier` holds.
    pub async fn is_match(&self, classifier: &Classifier) -> bool {
        let version = self.platform_version();
        if !self.version_membership(classifier, version.as_deref()) {
            return false;
        }
        let name = classifier.name_any();
        for constraint in &classifier.spec.deployed_resource_constraints {
            match self.is_resource_match(constraint).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!("Classifier {}: cannot check {}: {}", name, resource_kind_of(constraint), e);
                    return false;
                }
            }
        }
        true
    }

    /// Evaluates `classifier` and records the result.
    ///
    /// Returns the result if the match state changed; it is also sent on
    /// the results channel. A classifier seen for the first time counts as
    /// previously not matching. Evaluations of the same classifier run one
    /// at a time, so a result never overwrites one computed from a later view
    /// of the cluster.
    pub async fn evaluate(&self, classifier: &Classifier) -> Option<ClassificationResult> {
        let name = classifier.name_any();
        let serial = Arc::clone(
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(name.clone())
                .or_default(),
        );
        let _serial = serial.lock().await;

        let is_match = self.is_match(classifier).await;
        let result = ClassificationResult {
            classifier: name.clone(),
            is_match,
            labels: classifier
                .spec
                .classifier_labels
                .iter()
                .map(|l| (l.key.clone(), l.value.clone()))
                .collect(),
        };
        if let Some(metrics) = &self.metrics {
            metrics.evaluations.inc();
        }

        let changed = {
            let mut state = self.state();
            if is_match {
                // Constraint errors are logged again if they come back
                state.warned.remove(&name);
            }
            let was_match = state.results.get(&name).is_some_and(|r| r.is_match);
            state.results.insert(name.clone(), result.clone());
            was_match != is_match
        };
        if !changed {
            return None;
        }

        info!("Classifier {} {}", name, if is_match { "matches" } else { "no longer matches" });
        if let Some(metrics) = self.metrics.as_ref().filter(|_| is_match) {
            metrics.matches.inc();
        }
        self.publish(result.clone());
        Some(result)
    }

    /// Evaluates every classifier, returning the ones whose state changed.
    pub async fn evaluate_all(&self, classifiers: &[Classifier]) -> Vec<ClassificationResult> {
        let mut changed = Vec::new();
        for classifier in classifiers {
            if let Some(result) = self.evaluate(classifier).await {
                changed.push(result);
            }
        }
        changed
    }

    /// Drops a deleted classifier. A classifier that was matching is
    /// reported as no longer matching.
    pub fn forget(&self, name: &str) -> Option<ClassificationResult> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).remove(name);
        let previous = {
            let mut state = self.state();
            state.warned.remove(name);
            state.results.remove(name)
        }?;
        if !previous.is_match {
            return None;
        }
        let result = ClassificationResult {
            is_match: false,
            ..previous
        };
        self.publish(result.clone());
        Some(result)
    }

    /// Latest result per classifier
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, ClassificationResult> {
        self.state().results.clone()
    }

    fn publish(&self, result: ClassificationResult) {
        if self.results.send(result).is_err() {
            debug!("No receiver for classification results");
        }
    }

    fn warn_once(&self, classifier: &str, error: &ControllerError) {
        if self.state().warned.insert(classifier.to_string()) {
            warn!("{}", error);
        }
    }
}

/// Compares a field of the instance body with the filter value.
///
/// Strings compare as-is, other scalars by their JSON rendering. A missing
/// field is different from every value.
fn field_matches(instance: &ResourceInstance, filter: &FieldFilter) -> bool {
    let actual = instance.field(&filter.path).map(|value| match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let equal = actual.as_deref() == Some(filter.value.as_str());
    match filter.operation {
        SelectorOperation::Equal => equal,
        SelectorOperation::Different => !equal,
    }
}

#[cfg(test)]
#[path = "evaluator_test.rs"]
mod evaluator_test;
