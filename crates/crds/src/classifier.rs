//! Classifier CRD
//!
//! Declares which clusters match a policy: constraints on the Kubernetes
//! version the cluster runs and on resources deployed in it, plus the labels
//! to apply when every constraint holds.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "classifier.microscaler.io",
    version = "v1alpha1",
    kind = "Classifier",
    shortname = "clf"
)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierSpec {
    /// Resources that must be present in the cluster, in declaration order
    #[serde(default)]
    pub deployed_resource_constraints: Vec<DeployedResourceConstraint>,

    /// Constraints on the Kubernetes version; all of them must hold.
    /// An empty list means the classifier does not look at the version.
    #[serde(default)]
    pub kubernetes_version_constraints: Vec<KubernetesVersionConstraint>,

    /// Labels applied to the cluster when the classifier matches
    #[serde(default)]
    pub classifier_labels: Vec<ClassifierLabel>,
}

impl ClassifierSpec {
    /// Returns true if at least one version constraint is declared.
    #[must_use]
    pub fn uses_kubernetes_version(&self) -> bool {
        !self.kubernetes_version_constraints.is_empty()
    }
}

/// A resource kind (plus optional filters) that must be present in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeployedResourceConstraint {
    /// API group of the resource ("" for the core group)
    #[serde(default)]
    pub group: String,

    /// API version of the resource (e.g., "v1")
    pub version: String,

    /// Kind of the resource (e.g., "Pod")
    pub kind: String,

    /// Only consider resources in this namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Label filters; a resource must satisfy all of them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_filters: Vec<LabelFilter>,

    /// Field filters on the resource body; a resource must satisfy all of them
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_filters: Vec<FieldFilter>,

    /// Minimum number of matching resources (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,

    /// Maximum number of matching resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
}

impl DeployedResourceConstraint {
    /// Creates a constraint requiring at least one resource of the given kind.
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }
}

/// Selection operator used by label and field filters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum SelectorOperation {
    /// Value must be equal
    #[default]
    Equal,

    /// Value must be different (or missing)
    Different,
}

/// Filter on a resource label.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelFilter {
    /// Label key
    pub key: String,

    /// Comparison to apply
    #[serde(default)]
    pub operation: SelectorOperation,

    /// Label value
    pub value: String,
}

/// Filter on a field of the resource body.
///
/// `path` is a dot separated path into the object, e.g. `spec.replicas` or
/// `status.phase`. Scalar values are compared by their string rendering.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldFilter {
    /// Dot separated path into the object
    pub path: String,

    /// Comparison to apply
    #[serde(default)]
    pub operation: SelectorOperation,

    /// Expected value
    pub value: String,
}

/// Comparison operator for version constraints
///
/// Serializes as PascalCase ("GreaterThanOrEqualTo", ...).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum ComparisonOperator {
    /// Versions are equal
    Equal,

    /// Versions differ
    NotEqual,

    /// Cluster version is greater than the constraint
    GreaterThan,

    /// Cluster version is greater than or equal to the constraint
    GreaterThanOrEqualTo,

    /// Cluster version is less than the constraint
    LessThan,

    /// Cluster version is less than or equal to the constraint
    LessThanOrEqualTo,
}

/// Constraint on the Kubernetes version of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesVersionConstraint {
    /// Version to compare against (e.g., "1.30.0" or "v1.30.0")
    pub version: String,

    /// Comparison operator
    pub comparison: ComparisonOperator,
}

/// Label applied to the cluster on match.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierLabel {
    /// Label key
    pub key: String,

    /// Label value
    pub value: String,
}
