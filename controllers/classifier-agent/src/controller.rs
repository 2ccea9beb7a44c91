//! Main controller implementation.
//!
//! Wires the watch manager, the evaluator and the node reconciler together
//! and owns their background tasks:
//! - watch manager loop: discovery and watch reconciliation on a ticker
//! - event router: watch events to re-evaluation of the classifiers that
//!   reference the kind
//! - trigger router: classifiers queued by the node reconciler
//! - Node and Classifier watchers
//! - metrics and probes endpoint

use crate::classifier_source::ClassifierSource;
use crate::config::AgentConfig;
use crate::error::ControllerError;
use crate::evaluator::{ClassificationResult, Evaluator};
use crate::manager::{references_kind, ManagerConfig, WatchManager, WatchNotification};
use crate::metrics::Metrics;
use crate::node_reconciler::NodeReconciler;
use crate::watcher::{watch_classifiers, watch_nodes};
use cluster_client::{ClusterClientTrait, KubeClusterClient, ResourceKind};
use crds::Classifier;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main controller for the classifier agent.
pub struct Controller {
    manager: Arc<WatchManager>,
    node_watcher: JoinHandle<Result<(), ControllerError>>,
    classifier_watcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
    background: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Creates the controller and starts its background tasks.
    pub async fn new(config: AgentConfig) -> Result<Self, ControllerError> {
        info!("Initializing classifier agent for cluster {}/{}", config.cluster_namespace, config.cluster_name);

        let kube_client = Client::try_default().await?;
        let cluster_client: Arc<dyn ClusterClientTrait> = Arc::new(KubeClusterClient::new(kube_client.clone()));
        let classifier_api: Api<Classifier> = Api::all(kube_client.clone());
        let node_api: Api<Node> = Api::all(kube_client);
        let source: Arc<dyn ClassifierSource> = Arc::new(classifier_api.clone());
        let metrics = Arc::new(Metrics::new()?);

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let evaluator = Arc::new(Evaluator::new(cluster_client.clone(), results_tx).with_metrics(metrics.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager_config = ManagerConfig {
            cluster_name: config.cluster_name.clone(),
            cluster_namespace: config.cluster_namespace.clone(),
            cluster_type: config.cluster_type,
            interval: config.discovery_interval,
            dry_run: config.dry_run,
        };
        let manager = Arc::new(
            WatchManager::new(cluster_client.clone(), manager_config, events_tx).with_metrics(metrics.clone()),
        );
        manager.initialize().await?;
        let shutdown = manager.shutdown_token();

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let node_reconciler = Arc::new(
            NodeReconciler::new(cluster_client, source.clone(), evaluator.clone(), trigger_tx)
                .with_metrics(metrics.clone()),
        );

        let resync = Arc::new(Notify::new());
        let mut background = Vec::new();

        background.push({
            let manager = manager.clone();
            let source = source.clone();
            let resync = resync.clone();
            tokio::spawn(async move { manager.run(source, resync).await })
        });
        background.push(tokio::spawn(route_watch_events(
            events_rx,
            source,
            evaluator.clone(),
            shutdown.clone(),
        )));
        background.push(tokio::spawn(route_triggers(trigger_rx, evaluator.clone(), shutdown.clone())));
        background.push(tokio::spawn(report_results(results_rx, shutdown.clone())));

        let node_watcher = tokio::spawn(watch_nodes(node_api, node_reconciler, shutdown.clone()));
        let classifier_watcher = tokio::spawn(watch_classifiers(classifier_api, evaluator, resync, shutdown.clone()));
        let metrics_server = tokio::spawn(crate::metrics::serve(config.metrics_addr, metrics, shutdown.clone()));

        Ok(Self {
            manager,
            node_watcher,
            classifier_watcher,
            metrics_server,
            background,
        })
    }

    /// Runs the controller until a termination signal or a watcher failure.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Classifier agent running");

        let outcome = tokio::select! {
            () = shutdown_signal() => {
                info!("Termination signal received");
                Ok(())
            }
            result = &mut self.node_watcher => flatten("Node watcher", result),
            result = &mut self.classifier_watcher => flatten("Classifier watcher", result),
            result = &mut self.metrics_server => flatten("Metrics server", result),
        };

        // Cancels the token every background task listens on
        self.manager.shutdown().await;
        for task in self.background {
            if let Err(e) = task.await {
                warn!("Background task did not exit cleanly: {}", e);
            }
        }
        info!("Classifier agent stopped");
        outcome
    }
}

fn flatten(
    name: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    match result {
        Ok(Ok(())) => Err(ControllerError::Task(format!("{name} exited"))),
        Ok(Err(e)) => Err(ControllerError::Task(format!("{name} error: {e}"))),
        Err(e) => Err(ControllerError::Task(format!("{name} panicked: {e}"))),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Re-evaluates the classifiers referencing each kind that saw an event.
///
/// Events that queued up while a batch was evaluated are coalesced per kind.
pub(crate) async fn route_watch_events(
    mut events: mpsc::UnboundedReceiver<WatchNotification>,
    source: Arc<dyn ClassifierSource>,
    evaluator: Arc<Evaluator>,
    shutdown: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            () = shutdown.cancelled() => break,
            next = events.recv() => match next {
                Some(notification) => notification,
                None => break,
            },
        };
        let mut kinds = BTreeSet::from([first.kind]);
        while let Ok(notification) = events.try_recv() {
            kinds.insert(notification.kind);
        }
        reevaluate_for_kinds(&kinds, source.as_ref(), &evaluator).await;
    }
    debug!("Watch event router stopped");
}

async fn reevaluate_for_kinds(kinds: &BTreeSet<ResourceKind>, source: &dyn ClassifierSource, evaluator: &Evaluator) {
    let classifiers = match source.list_classifiers().await {
        Ok(classifiers) => classifiers,
        Err(e) => {
            warn!("Cannot re-evaluate classifiers: {}", e);
            return;
        }
    };
    for classifier in classifiers
        .iter()
        .filter(|c| kinds.iter().any(|kind| references_kind(&c.spec, kind)))
    {
        debug!("Re-evaluating classifier {}", classifier.name_any());
        evaluator.evaluate(classifier).await;
    }
}

/// Evaluates classifiers queued by the node reconciler.
pub(crate) async fn route_triggers(
    mut triggers: mpsc::UnboundedReceiver<Classifier>,
    evaluator: Arc<Evaluator>,
    shutdown: CancellationToken,
) {
    loop {
        let classifier = tokio::select! {
            () = shutdown.cancelled() => break,
            next = triggers.recv() => match next {
                Some(classifier) => classifier,
                None => break,
            },
        };
        evaluator.evaluate(&classifier).await;
    }
    debug!("Trigger router stopped");
}

async fn report_results(mut results: mpsc::UnboundedReceiver<ClassificationResult>, shutdown: CancellationToken) {
    loop {
        let result = tokio::select! {
            () = shutdown.cancelled() => break,
            next = results.recv() => match next {
                Some(result) => result,
                None => break,
            },
        };
        let labels: Vec<String> = result.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        if result.is_match {
            info!("Cluster matches classifier {} (labels: {})", result.classifier, labels.join(","));
        } else {
            info!("Cluster no longer matches classifier {}", result.classifier);
        }
    }
    if !shutdown.is_cancelled() {
        error!("Classification results channel closed");
    }
}
