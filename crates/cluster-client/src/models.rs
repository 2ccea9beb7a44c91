//! Cluster API data models
//!
//! Resource kinds are not known at compile time, so everything here is
//! expressed over `ResourceKind` values and untyped JSON bodies.

use crate::error::ClusterError;
use futures::stream::BoxStream;
use kube::core::{DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Group/Version/Kind triple identifying an API resource type.
///
/// Equality and hashing are by value on all three fields (case-sensitive).
/// Ordering is by kind, then group, then version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKind {
    /// API group ("" for the core group)
    pub group: String,
    /// API version (e.g., "v1")
    pub version: String,
    /// Kind (e.g., "Pod")
    pub kind: String,
}

impl ResourceKind {
    /// Creates a new resource kind.
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Returns the `apiVersion` string ("v1" or "group/version").
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Ord for ResourceKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.group.cmp(&other.group))
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl PartialOrd for ResourceKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

impl From<GroupVersionKind> for ResourceKind {
    fn from(gvk: GroupVersionKind) -> Self {
        Self::new(gvk.group, gvk.version, gvk.kind)
    }
}

impl From<&ResourceKind> for GroupVersionKind {
    fn from(kind: &ResourceKind) -> Self {
        GroupVersionKind::gvk(&kind.group, &kind.version, &kind.kind)
    }
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct InstalledKinds {
    /// Kinds served by the API server
    pub kinds: HashSet<ResourceKind>,
    /// Group/versions that could not be enumerated during this pass
    pub unreachable: Vec<String>,
}

impl InstalledKinds {
    /// Returns true if some group/versions could not be enumerated.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.unreachable.is_empty()
    }
}

/// An instance of some resource kind, with an untyped body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInstance {
    /// Object name
    pub name: String,
    /// Object namespace (None for cluster-scoped objects)
    pub namespace: Option<String>,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Full object as JSON
    pub data: serde_json::Value,
}

impl ResourceInstance {
    /// Creates an instance with no labels and an empty body.
    pub fn new(name: impl Into<String>, namespace: Option<&str>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.map(ToString::to_string),
            labels: BTreeMap::new(),
            data: serde_json::Value::Null,
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Replaces the object body.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Looks up a dot separated path (`spec.replicas`) in the object body.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.data, |value, segment| match value {
                serde_json::Value::Object(map) => map.get(segment),
                serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }
}

impl TryFrom<DynamicObject> for ResourceInstance {
    type Error = ClusterError;

    fn try_from(obj: DynamicObject) -> Result<Self, Self::Error> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| ClusterError::InvalidResource("object missing metadata.name".to_string()))?;
        let namespace = obj.metadata.namespace.clone();
        let labels = obj.metadata.labels.clone().unwrap_or_default();
        let data = serde_json::to_value(&obj)?;
        Ok(Self {
            name,
            namespace,
            labels,
            data,
        })
    }
}

/// Label requirement operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorOp {
    /// `key=value`
    Equal,
    /// `key!=value` (also satisfied when the label is missing)
    NotEqual,
}

/// A single `key (=|!=) value` requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequirement {
    /// Label key
    pub key: String,
    /// Operator
    pub op: SelectorOp,
    /// Label value
    pub value: String,
}

/// Equality-based label selector (conjunction of requirements).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    /// Creates an empty selector that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `key=value` requirement.
    #[must_use]
    pub fn equal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(LabelRequirement {
            key: key.into(),
            op: SelectorOp::Equal,
            value: value.into(),
        });
        self
    }

    /// Adds a `key!=value` requirement.
    #[must_use]
    pub fn not_equal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.push(LabelRequirement {
            key: key.into(),
            op: SelectorOp::NotEqual,
            value: value.into(),
        });
        self
    }

    /// Returns true if the selector has no requirements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Checks a label set against every requirement.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| {
            let current = labels.get(&req.key);
            match req.op {
                SelectorOp::Equal => current == Some(&req.value),
                SelectorOp::NotEqual => current != Some(&req.value),
            }
        })
    }

    /// Renders the selector in API server query syntax (`a=b,c!=d`).
    #[must_use]
    pub fn to_query(&self) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|req| match req.op {
                SelectorOp::Equal => format!("{}={}", req.key, req.value),
                SelectorOp::NotEqual => format!("{}!={}", req.key, req.value),
            })
            .collect();
        Some(parts.join(","))
    }
}

/// Options for listing instances of a kind
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Restrict to one namespace (ignored for cluster-scoped kinds)
    pub namespace: Option<String>,
    /// Label selector
    pub label_selector: LabelSelector,
}

/// Facts read from a node's status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeStatus {
    /// Node name
    pub name: String,
    /// Kubelet version reported in `status.nodeInfo.kubeletVersion`
    pub kubelet_version: Option<String>,
    /// Whether the node carries a control-plane role label
    pub control_plane: bool,
    /// `metadata.generation`, if set
    pub generation: Option<i64>,
}

/// Change event from a watch subscription
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Instance added or modified
    Applied(ResourceInstance),
    /// Instance removed
    Deleted(ResourceInstance),
    /// Initial listing (or relist after reconnect) finished
    Resynced,
}

/// Stream of watch events for one kind
pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClusterError>>;
