//! Unit tests for the node version reconciler

use super::*;
use crate::evaluator::ClassificationResult;
use crate::test_utils::{classifier_with_resources, classifier_with_version, node_status, pod_kind, StaticClassifierSource};
use cluster_client::MockClusterClient;
use crds::ComparisonOperator;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    mock: MockClusterClient,
    source: Arc<StaticClassifierSource>,
    evaluator: Arc<Evaluator>,
    reconciler: NodeReconciler,
    triggers: mpsc::UnboundedReceiver<Classifier>,
    _results: mpsc::UnboundedReceiver<ClassificationResult>,
}

fn fixture(classifiers: Vec<Classifier>) -> Fixture {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    let source = Arc::new(StaticClassifierSource::new(classifiers));
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let evaluator = Arc::new(Evaluator::new(Arc::new(mock.clone()), results_tx));
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let reconciler = NodeReconciler::new(
        Arc::new(mock.clone()),
        source.clone(),
        evaluator.clone(),
        trigger_tx,
    );
    Fixture {
        mock,
        source,
        evaluator,
        reconciler,
        triggers: trigger_rx,
        _results: results_rx,
    }
}

fn facts(name: &str, version: &str, control_plane: bool) -> NodeFacts {
    NodeFacts::from(node_status(name, version, control_plane))
}

#[test]
fn test_effective_version_prefers_control_plane() {
    let nodes = [
        facts("cp-1", "v1.30.2", true),
        facts("cp-2", "v1.30.1", true),
        facts("worker-1", "v1.29.0", false),
    ];
    assert_eq!(effective_version(&nodes), Some("v1.30.1".to_string()));
}

#[test]
fn test_effective_version_falls_back_to_all_nodes() {
    let nodes = [
        facts("worker-1", "v1.31.0+k3s1", false),
        facts("worker-2", "v1.30.4-eks-1a2b", false),
        facts("worker-3", "unknown", false),
    ];
    assert_eq!(effective_version(&nodes), Some("v1.30.4-eks-1a2b".to_string()));
    assert_eq!(effective_version(&[] as &[NodeFacts]), None);
}

#[test]
fn test_effective_version_ties_resolve_by_node_name() {
    let a = facts("cp-a", "v1.30.0-eks-b", true);
    let b = facts("cp-b", "v1.30.0-eks-a", true);
    assert_eq!(effective_version([&a, &b]), Some("v1.30.0-eks-b".to_string()));
    assert_eq!(effective_version([&b, &a]), Some("v1.30.0-eks-b".to_string()));
}

#[tokio::test]
async fn test_find_classifier_using_kubernetes_version() {
    let f = fixture(vec![
        classifier_with_version("a", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0"),
        classifier_with_resources("b", vec![pod_kind()]),
        classifier_with_version("c", ComparisonOperator::LessThan, "1.25.0"),
    ]);

    let names: Vec<String> = f
        .reconciler
        .find_classifier_using_kubernetes_version()
        .await
        .unwrap()
        .iter()
        .map(ResourceExt::name_any)
        .collect();
    assert_eq!(names, vec!["a".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn test_version_change_surfaces_only_version_classifiers() {
    let mut f = fixture(vec![
        classifier_with_version("a", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0"),
        classifier_with_resources("b", vec![pod_kind()]),
    ]);
    f.mock.set_node(node_status("cp-1", "v1.29.0", true));
    f.reconciler.reconcile_node("cp-1").await.unwrap();
    assert_eq!(f.reconciler.kubernetes_version(), Some("v1.29.0".to_string()));

    f.mock.set_node(node_status("cp-1", "v1.32.0", true));
    let queued = f.reconciler.reconcile_node("cp-1").await.unwrap();

    assert_eq!(queued, vec!["a".to_string()]);
    assert_eq!(f.triggers.recv().await.unwrap().name_any(), "a");
    assert!(f.triggers.try_recv().is_err());
    assert_eq!(f.reconciler.kubernetes_version(), Some("v1.32.0".to_string()));
    assert_eq!(f.evaluator.platform_version(), Some("v1.32.0".to_string()));
}

#[tokio::test]
async fn test_node_reconcile_updates_version_even_without_flips() {
    let f = fixture(vec![classifier_with_version("old", ComparisonOperator::LessThan, "1.20.0")]);
    f.mock.set_node(node_status("cp-1", "v1.29.0", true));

    let queued = f.reconciler.reconcile_node("cp-1").await.unwrap();

    assert!(queued.is_empty());
    assert_eq!(f.reconciler.kubernetes_version(), Some("v1.29.0".to_string()));
    assert_eq!(
        f.reconciler.node_facts("cp-1").unwrap().version,
        Some("v1.29.0".to_string())
    );
}

#[tokio::test]
async fn test_unchanged_version_is_noop() {
    let f = fixture(vec![classifier_with_version("a", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0")]);
    f.mock.set_node(node_status("cp-1", "v1.31.0", true));
    assert_eq!(f.reconciler.reconcile_node("cp-1").await.unwrap(), vec!["a".to_string()]);

    // A failing source proves the classifiers are not even listed
    f.source.fail_with("should not be called");
    assert!(f.reconciler.reconcile_node("cp-1").await.unwrap().is_empty());

    // A worker with a newer kubelet does not move the control-plane version
    f.mock.set_node(node_status("worker-1", "v1.32.0", false));
    assert!(f.reconciler.reconcile_node("worker-1").await.unwrap().is_empty());
    assert_eq!(f.reconciler.kubernetes_version(), Some("v1.31.0".to_string()));
}

#[tokio::test]
async fn test_list_error_is_returned_and_retried() {
    let f = fixture(vec![classifier_with_version("a", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0")]);
    f.mock.set_node(node_status("cp-1", "v1.31.0", true));
    f.source.fail_with("apiserver unavailable");

    let err = f.reconciler.reconcile_node("cp-1").await.unwrap_err();
    assert!(matches!(err, ControllerError::List(_)));
    assert_eq!(f.reconciler.kubernetes_version(), None);

    f.source.recover();
    assert_eq!(f.reconciler.reconcile_node("cp-1").await.unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_node_read_error_is_returned() {
    let f = fixture(vec![]);
    f.mock.fail_node_reads(Some("timeout"));

    let err = f.reconciler.reconcile("cp-1").await.unwrap_err();
    assert!(matches!(err, ControllerError::Cluster(_)));
}

#[tokio::test]
async fn test_deleted_node_drops_facts() {
    let f = fixture(vec![classifier_with_version("a", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0")]);
    f.mock.set_node(node_status("cp-1", "v1.31.0", true));
    f.reconciler.reconcile_node("cp-1").await.unwrap();

    f.mock.remove_node("cp-1");
    let queued = f.reconciler.reconcile_node("cp-1").await.unwrap();

    assert!(f.reconciler.node_facts("cp-1").is_none());
    assert_eq!(f.reconciler.kubernetes_version(), None);
    assert_eq!(queued, vec!["a".to_string()]);
}

#[tokio::test]
async fn test_error_policy_backs_off_per_node() {
    let f = fixture(vec![]);
    let err = ControllerError::List("boom".to_string());

    let first = f.reconciler.error_policy("cp-1", &err);
    let _ = f.reconciler.error_policy("cp-1", &err);
    let third = f.reconciler.error_policy("cp-1", &err);
    let other = f.reconciler.error_policy("cp-2", &err);

    assert_eq!(first, Action::requeue(Duration::from_secs(5)));
    assert_eq!(third, Action::requeue(Duration::from_secs(10)));
    assert_eq!(other, Action::requeue(Duration::from_secs(5)));

    f.mock.set_node(node_status("cp-1", "v1.30.0", true));
    assert_eq!(f.reconciler.reconcile("cp-1").await.unwrap(), Action::await_change());
    assert_eq!(f.reconciler.error_policy("cp-1", &err), Action::requeue(Duration::from_secs(5)));
}

#[tokio::test]
async fn test_concurrent_node_reconciles_apply_latest_version() {
    let f = fixture(vec![classifier_with_version("a", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0")]);
    let reconciler = Arc::new(f.reconciler);
    f.mock.set_node(node_status("cp-1", "v1.31.0", true));

    f.source.gate.arm();
    let slow = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        async move { reconciler.reconcile_node("cp-1").await }
    });
    f.source.gate.wait_entered().await;

    // A second control-plane node with an older kubelet joins meanwhile
    f.mock.set_node(node_status("cp-2", "v1.29.0", true));
    let fast = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        async move { reconciler.reconcile_node("cp-2").await }
    });
    tokio::task::yield_now().await;
    f.source.gate.release();

    assert_eq!(slow.await.unwrap().unwrap(), vec!["a".to_string()]);
    assert_eq!(fast.await.unwrap().unwrap(), vec!["a".to_string()]);
    assert_eq!(reconciler.kubernetes_version(), Some("v1.29.0".to_string()));
    assert_eq!(f.evaluator.platform_version(), Some("v1.29.0".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_triggered_classifier_is_evaluated_against_new_version() {
    let mock = MockClusterClient::new();
    let source = Arc::new(StaticClassifierSource::new(vec![classifier_with_version(
        "a",
        ComparisonOperator::GreaterThanOrEqualTo,
        "1.30.0",
    )]));
    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let evaluator = Arc::new(Evaluator::new(Arc::new(mock.clone()), results_tx));
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let reconciler = NodeReconciler::new(Arc::new(mock.clone()), source, Arc::clone(&evaluator), trigger_tx);
    let shutdown = CancellationToken::new();
    let router = tokio::spawn(crate::controller::route_triggers(trigger_rx, evaluator, shutdown.clone()));

    mock.set_node(node_status("cp-1", "v1.31.0", true));
    assert_eq!(reconciler.reconcile_node("cp-1").await.unwrap(), vec!["a".to_string()]);

    let result = tokio::time::timeout(Duration::from_secs(5), results_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.classifier, "a");
    assert!(result.is_match);

    shutdown.cancel();
    router.await.unwrap();
}
