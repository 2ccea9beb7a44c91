//! Mock ClusterClient for unit testing
//!
//! This module provides a mock implementation of ClusterClientTrait that can be used
//! in unit tests without requiring a running API server. It keeps installed kinds,
//! instances and nodes in memory, hands out channel-backed watch streams and
//! counts how many subscriptions were opened and how many are still alive.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{
    InstalledKinds, ListOptions, NodeStatus, ResourceInstance, ResourceKind, WatchEvent, WatchStream,
};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

type Subscriber = UnboundedSender<Result<WatchEvent, ClusterError>>;

/// Mock ClusterClient for testing
///
/// Clones share state, so a test can keep one clone to drive the cluster
/// while the code under test owns another.
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) installed: Arc<Mutex<HashSet<ResourceKind>>>,
    pub(crate) unreachable: Arc<Mutex<Vec<String>>>,
    pub(crate) discovery_failure: Arc<Mutex<Option<String>>>,
    pub(crate) instances: Arc<Mutex<HashMap<ResourceKind, Vec<ResourceInstance>>>>,
    pub(crate) nodes: Arc<Mutex<HashMap<String, NodeStatus>>>,
    pub(crate) node_failure: Arc<Mutex<Option<String>>>,
    pub(crate) failing_watches: Arc<Mutex<HashSet<ResourceKind>>>,
    pub(crate) subscribers: Arc<Mutex<HashMap<ResourceKind, Vec<Subscriber>>>>,
    pub(crate) watch_opens: Arc<Mutex<HashMap<ResourceKind, usize>>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

impl MockClusterClient {
    /// Create a new mock client with no installed kinds
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock client serving the given kinds
    #[must_use]
    pub fn with_kinds(kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        let mock = Self::new();
        for kind in kinds {
            mock.install_kind(kind);
        }
        mock
    }

    /// Mark a kind as served (e.g., a CRD was applied)
    pub fn install_kind(&self, kind: ResourceKind) {
        self.installed.lock().unwrap().insert(kind);
    }

    /// Stop serving a kind; open watches on it end
    pub fn uninstall_kind(&self, kind: &ResourceKind) {
        self.installed.lock().unwrap().remove(kind);
        self.instances.lock().unwrap().remove(kind);
        self.subscribers.lock().unwrap().remove(kind);
    }

    /// Report these group/versions as unreachable in discovery
    pub fn set_unreachable(&self, group_versions: Vec<String>) {
        *self.unreachable.lock().unwrap() = group_versions;
    }

    /// Make discovery fail as a whole (`None` to recover)
    pub fn fail_discovery(&self, message: Option<&str>) {
        *self.discovery_failure.lock().unwrap() = message.map(ToString::to_string);
    }

    /// Make `watch` fail for a kind (or succeed again)
    pub fn fail_watch(&self, kind: &ResourceKind, fail: bool) {
        let mut failing = self.failing_watches.lock().unwrap();
        if fail {
            failing.insert(kind.clone());
        } else {
            failing.remove(kind);
        }
    }

    /// Make node reads fail (`None` to recover)
    pub fn fail_node_reads(&self, message: Option<&str>) {
        *self.node_failure.lock().unwrap() = message.map(ToString::to_string);
    }

    /// Add or replace an instance and notify live watchers
    pub fn apply_instance(&self, kind: &ResourceKind, instance: ResourceInstance) {
        {
            let mut instances = self.instances.lock().unwrap();
            let items = instances.entry(kind.clone()).or_default();
            items.retain(|i| !(i.name == instance.name && i.namespace == instance.namespace));
            items.push(instance.clone());
        }
        self.emit(kind, WatchEvent::Applied(instance));
    }

    /// Remove an instance and notify live watchers
    pub fn delete_instance(&self, kind: &ResourceKind, name: &str, namespace: Option<&str>) {
        let removed = {
            let mut instances = self.instances.lock().unwrap();
            let Some(items) = instances.get_mut(kind) else {
                return;
            };
            let position = items
                .iter()
                .position(|i| i.name == name && i.namespace.as_deref() == namespace);
            position.map(|p| items.remove(p))
        };
        if let Some(instance) = removed {
            self.emit(kind, WatchEvent::Deleted(instance));
        }
    }

    /// Add or replace a node
    pub fn set_node(&self, node: NodeStatus) {
        self.nodes.lock().unwrap().insert(node.name.clone(), node);
    }

    /// Remove a node
    pub fn remove_node(&self, name: &str) {
        self.nodes.lock().unwrap().remove(name);
    }

    /// Send an event to every live watcher of a kind; returns how many received it
    pub fn emit(&self, kind: &ResourceKind, event: WatchEvent) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        let Some(senders) = subscribers.get_mut(kind) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.unbounded_send(Ok(event.clone())).is_ok())
            .count()
    }

    /// Number of times `watch` succeeded for a kind
    #[must_use]
    pub fn watch_open_count(&self, kind: &ResourceKind) -> usize {
        self.watch_opens.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    /// Number of watch streams for a kind that are still held by someone
    #[must_use]
    pub fn live_watch_count(&self, kind: &ResourceKind) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(kind)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Number of live watch streams across all kinds
    #[must_use]
    pub fn total_live_watches(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .values()
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .sum()
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn list_installed_kinds(&self) -> Result<InstalledKinds, ClusterError> {
        if let Some(message) = self.discovery_failure.lock().unwrap().clone() {
            return Err(ClusterError::Discovery(message));
        }
        let unreachable = self.unreachable.lock().unwrap().clone();
        let kinds = self
            .installed
            .lock()
            .unwrap()
            .iter()
            .filter(|k| !unreachable.contains(&k.api_version()))
            .cloned()
            .collect();
        Ok(InstalledKinds { kinds, unreachable })
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<ResourceInstance>, ClusterError> {
        if !self.installed.lock().unwrap().contains(kind) {
            return Err(ClusterError::KindNotInstalled(kind.to_string()));
        }
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .get(kind)
            .map(|items| {
                items
                    .iter()
                    .filter(|i| match &options.namespace {
                        Some(ns) => i.namespace.as_deref() == Some(ns.as_str()),
                        None => true,
                    })
                    .filter(|i| options.label_selector.matches(&i.labels))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, ClusterError> {
        if !self.installed.lock().unwrap().contains(kind) {
            return Err(ClusterError::KindNotInstalled(kind.to_string()));
        }
        if self.failing_watches.lock().unwrap().contains(kind) {
            return Err(ClusterError::Unavailable(format!("watch for {kind} refused")));
        }
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().entry(kind.clone()).or_default().push(tx);
        *self.watch_opens.lock().unwrap().entry(kind.clone()).or_insert(0) += 1;
        Ok(rx.boxed())
    }

    async fn get_node_status(&self, name: &str) -> Result<Option<NodeStatus>, ClusterError> {
        if let Some(message) = self.node_failure.lock().unwrap().clone() {
            return Err(ClusterError::Unavailable(message));
        }
        Ok(self.nodes.lock().unwrap().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pods() -> ResourceKind {
        ResourceKind::new("", "v1", "Pod")
    }

    #[tokio::test]
    async fn test_watch_receives_applied_instances() {
        let mock = MockClusterClient::with_kinds([pods()]);
        let mut stream = mock.watch(&pods()).await.unwrap();

        mock.apply_instance(&pods(), ResourceInstance::new("web", Some("default")));

        let event = stream.next().await.unwrap().unwrap();
        assert!(matches!(event, WatchEvent::Applied(ref i) if i.name == "web"));
        assert_eq!(mock.watch_open_count(&pods()), 1);
        assert_eq!(mock.live_watch_count(&pods()), 1);

        drop(stream);
        assert_eq!(mock.live_watch_count(&pods()), 0);
    }

    #[tokio::test]
    async fn test_watch_of_missing_kind_fails() {
        let mock = MockClusterClient::new();
        let err = mock.watch(&pods()).await.err().unwrap();
        assert!(err.is_kind_not_installed());
    }

    #[tokio::test]
    async fn test_list_filters_namespace_and_labels() {
        let mock = MockClusterClient::with_kinds([pods()]);
        mock.apply_instance(&pods(), ResourceInstance::new("a", Some("prod")).with_label("app", "web"));
        mock.apply_instance(&pods(), ResourceInstance::new("b", Some("dev")).with_label("app", "web"));
        mock.apply_instance(&pods(), ResourceInstance::new("c", Some("prod")).with_label("app", "db"));

        let options = ListOptions {
            namespace: Some("prod".to_string()),
            label_selector: crate::LabelSelector::new().equal("app", "web"),
        };
        let items = mock.list(&pods(), &options).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "a");
    }

    #[tokio::test]
    async fn test_discovery_reports_unreachable_group_versions() {
        let deployments = ResourceKind::new("apps", "v1", "Deployment");
        let mock = MockClusterClient::with_kinds([pods(), deployments.clone()]);
        mock.set_unreachable(vec!["apps/v1".to_string()]);

        let installed = mock.list_installed_kinds().await.unwrap();
        assert!(installed.is_partial());
        assert!(installed.kinds.contains(&pods()));
        assert!(!installed.kinds.contains(&deployments));
    }
}
