//! kube-backed cluster client
//!
//! Discovery walks every served group/version individually so that one
//! broken aggregated API (a metrics server mid-rollout, say) only removes its
//! own kinds from the result instead of failing the pass.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{
    InstalledKinds, ListOptions, NodeStatus, ResourceInstance, ResourceKind, WatchEvent, WatchStream,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const CONTROL_PLANE_LABELS: [&str; 2] = [
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// How to address a discovered kind
#[derive(Debug, Clone)]
struct ResourceMeta {
    api_resource: ApiResource,
    namespaced: bool,
}

/// Cluster client backed by `kube::Client`.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    /// Plural names and scopes learned from the last discovery pass
    resources: Arc<RwLock<HashMap<ResourceKind, ResourceMeta>>>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Wraps an existing kube client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Builds a client from the in-cluster config or local kubeconfig.
    pub async fn try_default() -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Returns the underlying kube client.
    #[must_use]
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn collect_resources(list: &APIResourceList, group: &str, version: &str, out: &mut Vec<(ResourceKind, ResourceMeta)>) {
        for resource in &list.resources {
            // Subresources ("pods/status") are not kinds of their own
            if resource.name.contains('/') {
                continue;
            }
            let group = resource.group.as_deref().unwrap_or(group);
            let version = resource.version.as_deref().unwrap_or(version);
            let gvk = GroupVersionKind::gvk(group, version, &resource.kind);
            out.push((
                ResourceKind::from(gvk.clone()),
                ResourceMeta {
                    api_resource: ApiResource::from_gvk_with_plural(&gvk, &resource.name),
                    namespaced: resource.namespaced,
                },
            ));
        }
    }

    /// Enumerates one group/version ("v1" or "apps/v1").
    async fn discover_group_version(&self, group_version: &str) -> Result<Vec<(ResourceKind, ResourceMeta)>, ClusterError> {
        let mut out = Vec::new();
        match group_version.split_once('/') {
            None => {
                let list = self.client.list_core_api_resources(group_version).await?;
                Self::collect_resources(&list, "", group_version, &mut out);
            }
            Some((group, version)) => {
                let list = self.client.list_api_group_resources(group_version).await?;
                Self::collect_resources(&list, group, version, &mut out);
            }
        }
        Ok(out)
    }

    /// Resolves addressing information for a kind, refreshing its
    /// group/version on a cache miss.
    async fn resolve(&self, kind: &ResourceKind) -> Result<ResourceMeta, ClusterError> {
        if let Some(meta) = self.cached(kind) {
            return Ok(meta);
        }
        let found = self.discover_group_version(&kind.api_version()).await.map_err(|e| {
            debug!("Failed to discover {}: {}", kind.api_version(), e);
            ClusterError::KindNotInstalled(kind.to_string())
        })?;
        self.remember(found);
        self.cached(kind)
            .ok_or_else(|| ClusterError::KindNotInstalled(kind.to_string()))
    }

    fn cached(&self, kind: &ResourceKind) -> Option<ResourceMeta> {
        self.resources
            .read()
            .ok()
            .and_then(|resources| resources.get(kind).cloned())
    }

    fn remember(&self, found: Vec<(ResourceKind, ResourceMeta)>) {
        if let Ok(mut resources) = self.resources.write() {
            resources.extend(found);
        }
    }

    fn api_for(&self, meta: &ResourceMeta, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if meta.namespaced => Api::namespaced_with(self.client.clone(), ns, &meta.api_resource),
            _ => Api::all_with(self.client.clone(), &meta.api_resource),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for KubeClusterClient {
    async fn list_installed_kinds(&self) -> Result<InstalledKinds, ClusterError> {
        let mut group_versions: Vec<String> = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|e| ClusterError::Discovery(format!("listing core API versions: {e}")))?
            .versions;

        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| ClusterError::Discovery(format!("listing API groups: {e}")))?;
        for group in groups.groups {
            group_versions.extend(group.versions.into_iter().map(|gv| gv.group_version));
        }

        let mut installed = InstalledKinds::default();
        let mut fresh = HashMap::new();
        for group_version in group_versions {
            match self.discover_group_version(&group_version).await {
                Ok(found) => {
                    for (kind, meta) in found {
                        installed.kinds.insert(kind.clone());
                        fresh.insert(kind, meta);
                    }
                }
                Err(e) => {
                    warn!("Skipping unreachable API group/version {}: {}", group_version, e);
                    installed.unreachable.push(group_version);
                }
            }
        }

        if let Ok(mut resources) = self.resources.write() {
            *resources = fresh;
        }
        debug!(
            "Discovered {} resource kinds ({} group/versions unreachable)",
            installed.kinds.len(),
            installed.unreachable.len()
        );
        Ok(installed)
    }

    async fn list(&self, kind: &ResourceKind, options: &ListOptions) -> Result<Vec<ResourceInstance>, ClusterError> {
        let meta = self.resolve(kind).await?;
        let api = self.api_for(&meta, options.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(query) = options.label_selector.to_query() {
            params = params.labels(&query);
        }
        let objects = api.list(&params).await?;
        objects
            .items
            .into_iter()
            .map(ResourceInstance::try_from)
            .collect()
    }

    async fn watch(&self, kind: &ResourceKind) -> Result<WatchStream, ClusterError> {
        let meta = self.resolve(kind).await?;
        let api = self.api_for(&meta, None);
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(obj) | Event::InitApply(obj)) => {
                        Some(ResourceInstance::try_from(obj).map(WatchEvent::Applied))
                    }
                    Ok(Event::Delete(obj)) => Some(ResourceInstance::try_from(obj).map(WatchEvent::Deleted)),
                    Ok(Event::InitDone) => Some(Ok(WatchEvent::Resynced)),
                    Ok(Event::Init) => None,
                    Err(e) => Some(Err(ClusterError::Watch(e.to_string()))),
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn get_node_status(&self, name: &str) -> Result<Option<NodeStatus>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let Some(node) = nodes.get_opt(name).await? else {
            return Ok(None);
        };
        let control_plane = node
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| CONTROL_PLANE_LABELS.iter().any(|l| labels.contains_key(*l)));
        let kubelet_version = node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|info| info.kubelet_version.clone());
        Ok(Some(NodeStatus {
            name: name.to_string(),
            kubelet_version,
            control_plane,
            generation: node.metadata.generation,
        }))
    }
}
