//! Kubernetes resource watchers.
//!
//! Nodes are reconciled through `kube_runtime::Controller`, which handles
//! reconnection, retries and per-object queuing. Classifiers are followed
//! with a plain watcher stream: every change re-evaluates the classifier and
//! asks the watch manager to resync.

use crate::error::ControllerError;
use crate::evaluator::Evaluator;
use crate::node_reconciler::NodeReconciler;
use crds::Classifier;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::watcher::{self, Event};
use kube_runtime::{Controller, WatchStreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs the node controller until `shutdown` is cancelled.
pub async fn watch_nodes(
    api: Api<Node>,
    reconciler: Arc<NodeReconciler>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting Node watcher");

    let reconcile = |node: Arc<Node>, ctx: Arc<NodeReconciler>| async move {
        let name = node.name_any();
        debug!("Reconciling Node {}", name);
        ctx.reconcile(&name).await
    };
    let error_policy =
        |node: Arc<Node>, error: &ControllerError, ctx: Arc<NodeReconciler>| ctx.error_policy(&node.name_any(), error);

    // Status heartbeats arrive every few seconds per node; debounce batches them
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(2))
        .concurrency(4);

    let controller = Controller::new(api, watcher::Config::default())
        .with_config(controller_config)
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("Node controller error: {}", e);
            }
        });

    tokio::select! {
        () = controller => warn!("Node controller stream ended"),
        () = shutdown.cancelled() => info!("Node watcher stopped"),
    }
    Ok(())
}

/// Follows classifier changes until `shutdown` is cancelled.
///
/// Applied classifiers are evaluated, deleted ones forgotten; both poke
/// `resync` so the watch set follows.
pub async fn watch_classifiers(
    api: Api<Classifier>,
    evaluator: Arc<Evaluator>,
    resync: Arc<Notify>,
    shutdown: CancellationToken,
) -> Result<(), ControllerError> {
    info!("Starting Classifier watcher");

    let mut stream = watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = stream.try_next() => event,
        };
        match event {
            Ok(Some(Event::Apply(classifier) | Event::InitApply(classifier))) => {
                debug!("Classifier {} changed", classifier.name_any());
                evaluator.evaluate(&classifier).await;
                resync.notify_one();
            }
            Ok(Some(Event::Delete(classifier))) => {
                let name = classifier.name_any();
                info!("Classifier {} deleted", name);
                evaluator.forget(&name);
                resync.notify_one();
            }
            Ok(Some(Event::Init | Event::InitDone)) => {}
            Ok(None) => {
                warn!("Classifier watch stream ended");
                break;
            }
            Err(e) => warn!("Classifier watch error: {}", e),
        }
    }
    info!("Classifier watcher stopped");
    Ok(())
}
