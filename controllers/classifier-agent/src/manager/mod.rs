//! Dynamic watch manager.
//!
//! Keeps exactly one watch subscription open per resource kind referenced by
//! a classifier. Kinds that are referenced but not served by the API server
//! yet (a CRD that has not been applied) are parked in a pending set and
//! promoted by a later pass once discovery sees them.
//!
//! All state sits behind one `std::sync::Mutex`. The lock is never held
//! across an `.await`: subscriptions are opened and stopped outside of it and
//! every transition is re-checked after the lock is taken again.

mod discovery;
mod handle;
mod watch_set;


pub use discovery::discover_installed_kinds;
pub use handle::WatchHandle;
pub use watch_set::{build_desired_set, build_list, build_sorted_list, gvk_installed, references_kind, resource_kind_of};

use crate::classifier_source::ClassifierSource;
use crate::config::ClusterType;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use chrono::Utc;
use cluster_client::{ClusterClientTrait, ResourceKind, WatchEvent, WatchStream};
use futures::StreamExt;
use handle::WatchEntry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Filter applied to events before they are forwarded
pub type EventPredicate = Arc<dyn Fn(&WatchEvent) -> bool + Send + Sync>;

/// Event received on one of the managed subscriptions
#[derive(Debug, Clone, PartialEq)]
pub struct WatchNotification {
    /// Kind the subscription is for
    pub kind: ResourceKind,
    /// The event
    pub event: WatchEvent,
}

/// Static settings of a manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name of the cluster being classified
    pub cluster_name: String,
    /// Namespace of the cluster object
    pub cluster_namespace: String,
    /// Cluster type
    pub cluster_type: ClusterType,
    /// Interval between discovery passes
    pub interval: Duration,
    /// Log watch changes instead of opening watches
    pub dry_run: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            cluster_namespace: "default".to_string(),
            cluster_type: ClusterType::default(),
            interval: Duration::from_secs(10),
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
struct ManagerState {
    initialized: bool,
    /// Installed-kind cache from the last successful discovery
    installed: HashSet<ResourceKind>,
    watchers: HashMap<ResourceKind, WatchEntry>,
    pending: HashSet<ResourceKind>,
    desired: HashSet<ResourceKind>,
}

fn lock(state: &Mutex<ManagerState>) -> MutexGuard<'_, ManagerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Watch lifecycle manager.
pub struct WatchManager {
    client: Arc<dyn ClusterClientTrait>,
    config: ManagerConfig,
    state: Arc<Mutex<ManagerState>>,
    root: CancellationToken,
    events: mpsc::UnboundedSender<WatchNotification>,
    predicate: Option<EventPredicate>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WatchManager {
    /// Creates a manager forwarding watch events to `events`.
    ///
    /// `initialize` must be called before the manager is used.
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        config: ManagerConfig,
        events: mpsc::UnboundedSender<WatchNotification>,
    ) -> Self {
        Self {
            client,
            config,
            state: Arc::new(Mutex::new(ManagerState::default())),
            root: CancellationToken::new(),
            events,
            predicate: None,
            metrics: None,
        }
    }

    /// Filter applied to every subscription opened by `update_watchers`
    #[must_use]
    pub fn with_predicate(mut self, predicate: EventPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Record watch gauges and counters in `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Static settings
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Loads the installed-kind cache and marks the manager ready.
    ///
    /// A second call is a no-op. A failed discovery leaves the cache empty;
    /// every desired kind is then pending until the next successful pass.
    pub async fn initialize(&self) -> Result<(), ControllerError> {
        if lock(&self.state).initialized {
            debug!("Watch manager already initialized");
            return Ok(());
        }

        let installed = match discover_installed_kinds(self.client.as_ref()).await {
            Ok(kinds) => kinds,
            Err(e) => {
                warn!("Initial discovery failed, retrying on next pass: {}", e);
                self.count_discovery_failure();
                HashSet::new()
            }
        };

        let mut state = lock(&self.state);
        if state.initialized {
            return Ok(());
        }
        state.installed = installed;
        state.initialized = true;
        info!(
            "Watch manager initialized for cluster {}/{} ({}), {} kinds installed{}",
            self.config.cluster_namespace,
            self.config.cluster_name,
            self.config.cluster_type,
            state.installed.len(),
            if self.config.dry_run { ", dry run" } else { "" }
        );
        Ok(())
    }

    /// Stops every watch and forgets all state. `initialize` is required again.
    pub async fn reset(&self) {
        let entries = {
            let mut state = lock(&self.state);
            let entries: Vec<WatchEntry> = state.watchers.drain().map(|(_, entry)| entry).collect();
            *state = ManagerState::default();
            self.publish(&state);
            entries
        };
        for entry in entries {
            entry.stop().await;
        }
        info!("Watch manager reset");
    }

    /// Stops every watch and waits for all watch tasks to exit.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let entries: Vec<WatchEntry> = {
            let mut state = lock(&self.state);
            let entries = state.watchers.drain().map(|(_, entry)| entry).collect();
            state.pending.clear();
            self.publish(&state);
            entries
        };
        let count = entries.len();
        for entry in entries {
            entry.stop().await;
        }
        info!("Watch manager shut down, {} watches stopped", count);
    }

    /// Token cancelled when the manager shuts down
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Reconciles running watches with `desired`.
    ///
    /// Watches no longer desired are stopped, desired kinds that are
    /// installed are started, the rest go to the pending set. Pending kinds
    /// that became installed are promoted. A kind whose watch fails to open
    /// stays pending and the rest of the batch proceeds.
    pub async fn update_watchers(&self, desired: &HashMap<ResourceKind, bool>) -> Result<(), ControllerError> {
        let wanted: HashSet<ResourceKind> = desired
            .iter()
            .filter(|(_, want)| **want)
            .map(|(kind, _)| kind.clone())
            .collect();

        let (to_start, removed) = {
            let mut state = lock(&self.state);
            if !state.initialized {
                return Err(ControllerError::NotInitialized);
            }
            state.desired = wanted.clone();

            // Entries whose handle was cancelled by a caller are stale
            let to_remove: Vec<ResourceKind> = state
                .watchers
                .iter()
                .filter(|(kind, entry)| !wanted.contains(*kind) || entry.handle.is_cancelled())
                .map(|(kind, _)| kind.clone())
                .collect();
            let removed: Vec<WatchEntry> = to_remove
                .iter()
                .filter_map(|kind| state.watchers.remove(kind))
                .collect();
            state.pending.retain(|kind| wanted.contains(kind));

            let mut to_start = Vec::new();
            for kind in build_sorted_list(desired) {
                if !wanted.contains(&kind) || state.watchers.contains_key(&kind) {
                    continue;
                }
                if gvk_installed(&kind, &state.installed) {
                    to_start.push(kind);
                } else if state.pending.insert(kind.clone()) {
                    info!("{} is not installed yet, watch deferred", kind);
                }
            }
            self.publish(&state);
            (to_start, removed)
        };

        for entry in removed {
            if wanted.contains(&entry.kind) {
                debug!("Watch handle for {} was cancelled, restarting", entry.kind);
            } else {
                info!("Stopping watch for {}, no classifier references it", entry.kind);
            }
            entry.stop().await;
        }

        for kind in to_start {
            if self.config.dry_run {
                info!("Dry run: would start watch for {}", kind);
                continue;
            }
            match self.open_watch(&kind, self.predicate.clone(), true).await {
                Ok(Some(_)) => {}
                Ok(None) => debug!("{} is no longer referenced, subscription dropped", kind),
                Err(e) => warn!("{}", e),
            }
        }

        self.publish(&lock(&self.state));
        Ok(())
    }

    /// Opens a subscription for `kind` and registers it.
    ///
    /// Returns the existing handle if the kind is already watched. Events
    /// for which `predicate` returns false are dropped.
    pub async fn start_watcher(
        &self,
        kind: &ResourceKind,
        predicate: Option<EventPredicate>,
    ) -> Result<WatchHandle, ControllerError> {
        self.open_watch(kind, predicate, false)
            .await?
            .ok_or_else(|| ControllerError::Watch {
                kind: kind.clone(),
                reason: "kind is no longer desired".to_string(),
            })
    }

    /// Opens and registers a subscription.
    ///
    /// With `only_if_desired`, a kind that a concurrent pass removed from the
    /// desired set while the subscription was opening is not registered and
    /// `None` is returned.
    async fn open_watch(
        &self,
        kind: &ResourceKind,
        predicate: Option<EventPredicate>,
        only_if_desired: bool,
    ) -> Result<Option<WatchHandle>, ControllerError> {
        {
            let state = lock(&self.state);
            if !state.initialized {
                return Err(ControllerError::NotInitialized);
            }
            if let Some(entry) = state.watchers.get(kind) {
                return Ok(Some(entry.handle.clone()));
            }
        }
        if self.root.is_cancelled() || self.config.dry_run {
            let reason = if self.config.dry_run { "dry run" } else { "manager is shut down" };
            return Err(ControllerError::Watch {
                kind: kind.clone(),
                reason: reason.to_string(),
            });
        }

        let stream = match self.client.watch(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.watch_start_failures.inc();
                }
                let mut state = lock(&self.state);
                if state.desired.contains(kind) {
                    state.pending.insert(kind.clone());
                }
                self.publish(&state);
                return Err(ControllerError::Watch {
                    kind: kind.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let mut state = lock(&self.state);
        if let Some(entry) = state.watchers.get(kind) {
            // Registered by a concurrent pass while the subscription was opening
            return Ok(Some(entry.handle.clone()));
        }
        if only_if_desired && !state.desired.contains(kind) {
            drop(stream);
            return Ok(None);
        }
        if self.root.is_cancelled() {
            return Err(ControllerError::Watch {
                kind: kind.clone(),
                reason: "manager is shut down".to_string(),
            });
        }

        let token = self.root.child_token();
        let handle = WatchHandle::new(token.clone());
        let task = tokio::spawn(forward_events(
            ForwardContext {
                kind: kind.clone(),
                id: handle.id(),
                token,
                predicate,
                events: self.events.clone(),
                state: Arc::clone(&self.state),
                metrics: self.metrics.clone(),
            },
            stream,
        ));
        state.pending.remove(kind);
        state.watchers.insert(
            kind.clone(),
            WatchEntry {
                kind: kind.clone(),
                handle: handle.clone(),
                started_at: Utc::now(),
                task,
            },
        );
        self.publish(&state);
        info!("Started watch for {}", kind);
        Ok(Some(handle))
    }

    /// Snapshot of the active subscriptions
    #[must_use]
    pub fn get_watchers(&self) -> HashMap<ResourceKind, WatchHandle> {
        lock(&self.state)
            .watchers
            .iter()
            .map(|(kind, entry)| (kind.clone(), entry.handle.clone()))
            .collect()
    }

    /// Snapshot of the pending kinds, sorted
    #[must_use]
    pub fn get_unknown_resources_to_watch(&self) -> Vec<ResourceKind> {
        let mut pending: Vec<ResourceKind> = lock(&self.state).pending.iter().cloned().collect();
        pending.sort();
        pending
    }

    /// When each active subscription was opened
    #[must_use]
    pub fn watch_started_at(&self, kind: &ResourceKind) -> Option<chrono::DateTime<Utc>> {
        lock(&self.state).watchers.get(kind).map(|entry| entry.started_at)
    }

    /// Refreshes the installed-kind cache.
    ///
    /// Active kinds that are no longer installed are stopped and moved back
    /// to pending. On failure the cache and the running watches are left as
    /// they are.
    pub async fn refresh_installed_kinds(&self) -> Result<(), ControllerError> {
        if !lock(&self.state).initialized {
            return Err(ControllerError::NotInitialized);
        }
        let installed = match discover_installed_kinds(self.client.as_ref()).await {
            Ok(kinds) => kinds,
            Err(e) => {
                self.count_discovery_failure();
                return Err(e);
            }
        };

        let demoted: Vec<WatchEntry> = {
            let mut state = lock(&self.state);
            let gone: Vec<ResourceKind> = state
                .watchers
                .keys()
                .filter(|kind| !installed.contains(*kind))
                .cloned()
                .collect();
            let demoted: Vec<WatchEntry> = gone.iter().filter_map(|kind| state.watchers.remove(kind)).collect();
            for kind in gone {
                if state.desired.contains(&kind) {
                    state.pending.insert(kind);
                }
            }
            state.installed = installed;
            self.publish(&state);
            demoted
        };

        for entry in demoted {
            warn!("{} is no longer installed, watch moved back to pending", entry.kind);
            entry.stop().await;
        }
        Ok(())
    }

    /// One full pass: discovery, classifier listing, watch reconciliation.
    pub async fn sync(&self, source: &dyn ClassifierSource) -> Result<(), ControllerError> {
        if let Err(e) = self.refresh_installed_kinds().await {
            // Active watches keep running on a stale cache
            warn!("Discovery pass failed: {}", e);
        }
        let desired = build_list(source).await?;
        self.update_watchers(&desired).await
    }

    /// Runs `sync` every interval, and whenever `resync` is notified, until
    /// the manager shuts down.
    pub async fn run(&self, source: Arc<dyn ClassifierSource>, resync: Arc<Notify>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = ticker.tick() => {}
                _ = resync.notified() => debug!("Classifier change, resyncing watches"),
            }
            if let Err(e) = self.sync(source.as_ref()).await {
                warn!("Watch sync failed: {}", e);
            }
        }
        debug!("Watch manager loop stopped");
    }

    fn publish(&self, state: &ManagerState) {
        if let Some(metrics) = &self.metrics {
            metrics.active_watches.set(i64::try_from(state.watchers.len()).unwrap_or(i64::MAX));
            metrics.pending_kinds.set(i64::try_from(state.pending.len()).unwrap_or(i64::MAX));
        }
    }

    fn count_discovery_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.discovery_failures.inc();
        }
    }
}

struct ForwardContext {
    kind: ResourceKind,
    id: uuid::Uuid,
    token: CancellationToken,
    predicate: Option<EventPredicate>,
    events: mpsc::UnboundedSender<WatchNotification>,
    state: Arc<Mutex<ManagerState>>,
    metrics: Option<Arc<Metrics>>,
}

/// Forwards events of one subscription until cancelled or the stream ends.
async fn forward_events(ctx: ForwardContext, mut stream: WatchStream) {
    loop {
        tokio::select! {
            biased;
            () = ctx.token.cancelled() => {
                debug!("Watch for {} cancelled", ctx.kind);
                return;
            }
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    if ctx.predicate.as_ref().is_some_and(|p| !p(&event)) {
                        continue;
                    }
                    let notification = WatchNotification { kind: ctx.kind.clone(), event };
                    if ctx.events.send(notification).is_err() {
                        debug!("No receiver for {} events", ctx.kind);
                    }
                }
                Some(Err(e)) => warn!("Watch error for {}: {}", ctx.kind, e),
                None => break,
            }
        }
    }

    // Closed by the API server; let the next pass reopen it
    let mut state = lock(&ctx.state);
    if state.watchers.get(&ctx.kind).is_some_and(|entry| entry.handle.id() == ctx.id) {
        state.watchers.remove(&ctx.kind);
        if state.desired.contains(&ctx.kind) {
            state.pending.insert(ctx.kind.clone());
        }
        warn!("Watch for {} ended, moved back to pending", ctx.kind);
    }
    if let Some(metrics) = &ctx.metrics {
        metrics.active_watches.set(i64::try_from(state.watchers.len()).unwrap_or(i64::MAX));
        metrics.pending_kinds.set(i64::try_from(state.pending.len()).unwrap_or(i64::MAX));
    }
}
