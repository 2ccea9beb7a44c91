//! Unit tests for the classification evaluator

use super::*;
use crate::test_utils::{classifier_with_resources, classifier_with_version, create_test_classifier, pod_kind, GatedClient};
use cluster_client::{MockClusterClient, ResourceKind};
use crds::{ComparisonOperator, KubernetesVersionConstraint, LabelFilter};

fn evaluator(mock: &MockClusterClient) -> (Evaluator, mpsc::UnboundedReceiver<ClassificationResult>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Evaluator::new(Arc::new(mock.clone()), tx), rx)
}

fn pod_constraint() -> DeployedResourceConstraint {
    DeployedResourceConstraint::new("", "v1", "Pod")
}

#[test]
fn test_version_match_without_constraints() {
    let spec = ClassifierSpec::default();
    assert!(Evaluator::is_version_match("any", &spec, None).unwrap());
    assert!(Evaluator::is_version_match("any", &spec, Some("garbage")).unwrap());
}

#[test]
fn test_version_match_all_constraints_must_hold() {
    let spec = ClassifierSpec {
        kubernetes_version_constraints: vec![
            KubernetesVersionConstraint {
                version: "1.28.0".to_string(),
                comparison: ComparisonOperator::GreaterThanOrEqualTo,
            },
            KubernetesVersionConstraint {
                version: "v1.31.0".to_string(),
                comparison: ComparisonOperator::LessThan,
            },
        ],
        ..Default::default()
    };

    assert!(Evaluator::is_version_match("range", &spec, Some("v1.30.2+k3s1")).unwrap());
    assert!(!Evaluator::is_version_match("range", &spec, Some("v1.31.0")).unwrap());
    assert!(!Evaluator::is_version_match("range", &spec, Some("v1.27.9-eks-1")).unwrap());
    assert!(!Evaluator::is_version_match("range", &spec, None).unwrap());
}

#[test]
fn test_malformed_version_is_constraint_error() {
    let classifier = classifier_with_version("bad", ComparisonOperator::Equal, "one.two");
    let err = Evaluator::is_version_match("bad", &classifier.spec, Some("v1.30.0")).unwrap_err();
    assert!(matches!(err, ControllerError::ConstraintEvaluation { ref classifier, .. } if classifier == "bad"));

    let ok = classifier_with_version("ok", ComparisonOperator::Equal, "1.30.0");
    assert!(Evaluator::is_version_match("ok", &ok.spec, Some("latest")).is_err());
}

#[tokio::test]
async fn test_malformed_version_fails_closed() {
    let mock = MockClusterClient::new();
    let (evaluator, _rx) = evaluator(&mock);
    evaluator.set_platform_version(Some("v1.30.0".to_string()));
    let classifier = classifier_with_version("bad", ComparisonOperator::GreaterThan, "not-a-version");

    assert!(!evaluator.is_match(&classifier).await);
    assert!(!evaluator.is_match(&classifier).await);
    assert!(evaluator.state().warned.contains("bad"));
}

#[tokio::test]
async fn test_resource_match_requires_an_instance() {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    let (evaluator, _rx) = evaluator(&mock);

    assert!(!evaluator.is_resource_match(&pod_constraint()).await.unwrap());

    mock.apply_instance(&pod_kind(), ResourceInstance::new("web", Some("default")));
    assert!(evaluator.is_resource_match(&pod_constraint()).await.unwrap());
}

#[tokio::test]
async fn test_missing_kind_is_non_match() {
    let mock = MockClusterClient::new();
    let (evaluator, _rx) = evaluator(&mock);
    let constraint = DeployedResourceConstraint::new("bootstrap.cluster.x-k8s.io", "v1beta1", "Kubeadmconfig");

    assert!(!evaluator.is_resource_match(&constraint).await.unwrap());
}

#[tokio::test]
async fn test_resource_filters() {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    mock.apply_instance(
        &pod_kind(),
        ResourceInstance::new("web", Some("prod"))
            .with_label("app", "web")
            .with_data(serde_json::json!({ "status": { "phase": "Running" }, "spec": { "priority": 10 } })),
    );
    mock.apply_instance(
        &pod_kind(),
        ResourceInstance::new("db", Some("prod"))
            .with_label("app", "db")
            .with_data(serde_json::json!({ "status": { "phase": "Pending" } })),
    );
    let (evaluator, _rx) = evaluator(&mock);

    let in_namespace = DeployedResourceConstraint {
        namespace: Some("dev".to_string()),
        ..pod_constraint()
    };
    assert!(!evaluator.is_resource_match(&in_namespace).await.unwrap());

    let by_label = DeployedResourceConstraint {
        label_filters: vec![LabelFilter {
            key: "app".to_string(),
            operation: SelectorOperation::Equal,
            value: "db".to_string(),
        }],
        ..pod_constraint()
    };
    assert!(evaluator.is_resource_match(&by_label).await.unwrap());

    let running = DeployedResourceConstraint {
        field_filters: vec![FieldFilter {
            path: "status.phase".to_string(),
            operation: SelectorOperation::Equal,
            value: "Running".to_string(),
        }],
        ..pod_constraint()
    };
    assert!(evaluator.is_resource_match(&running).await.unwrap());

    let priority = DeployedResourceConstraint {
        field_filters: vec![FieldFilter {
            path: "spec.priority".to_string(),
            operation: SelectorOperation::Equal,
            value: "10".to_string(),
        }],
        ..pod_constraint()
    };
    assert!(evaluator.is_resource_match(&priority).await.unwrap());

    let not_running_web = DeployedResourceConstraint {
        label_filters: vec![LabelFilter {
            key: "app".to_string(),
            operation: SelectorOperation::Equal,
            value: "web".to_string(),
        }],
        field_filters: vec![FieldFilter {
            path: "status.phase".to_string(),
            operation: SelectorOperation::Different,
            value: "Running".to_string(),
        }],
        ..pod_constraint()
    };
    assert!(!evaluator.is_resource_match(&not_running_web).await.unwrap());
}

#[tokio::test]
async fn test_resource_count_bounds() {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    for name in ["a", "b", "c"] {
        mock.apply_instance(&pod_kind(), ResourceInstance::new(name, Some("default")));
    }
    let (evaluator, _rx) = evaluator(&mock);

    let at_least_three = DeployedResourceConstraint {
        min_count: Some(3),
        ..pod_constraint()
    };
    let at_most_two = DeployedResourceConstraint {
        max_count: Some(2),
        ..pod_constraint()
    };
    let none = DeployedResourceConstraint {
        min_count: Some(0),
        max_count: Some(0),
        ..pod_constraint()
    };

    assert!(evaluator.is_resource_match(&at_least_three).await.unwrap());
    assert!(!evaluator.is_resource_match(&at_most_two).await.unwrap());
    assert!(!evaluator.is_resource_match(&none).await.unwrap());
}

#[tokio::test]
async fn test_kind_removed_at_runtime_is_non_match() {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    mock.apply_instance(&pod_kind(), ResourceInstance::new("web", Some("default")));
    let (evaluator, _rx) = evaluator(&mock);
    assert!(evaluator.is_resource_match(&pod_constraint()).await.unwrap());

    mock.uninstall_kind(&pod_kind());

    assert!(!evaluator.is_resource_match(&pod_constraint()).await.unwrap());
}

#[tokio::test]
async fn test_evaluate_reports_transitions_only() {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    let (evaluator, mut rx) = evaluator(&mock);
    let classifier = classifier_with_resources("pods", vec![pod_kind()]);

    assert_eq!(evaluator.evaluate(&classifier).await, None);
    assert!(!evaluator.snapshot()["pods"].is_match);

    mock.apply_instance(&pod_kind(), ResourceInstance::new("web", Some("default")));
    let result = evaluator.evaluate(&classifier).await.unwrap();
    assert!(result.is_match);
    assert_eq!(result.labels.get("classifier"), Some(&"pods".to_string()));
    assert_eq!(rx.recv().await.unwrap(), result);

    assert_eq!(evaluator.evaluate(&classifier).await, None);

    mock.delete_instance(&pod_kind(), "web", Some("default"));
    let result = evaluator.evaluate(&classifier).await.unwrap();
    assert!(!result.is_match);
    assert!(!rx.recv().await.unwrap().is_match);
}

#[tokio::test]
async fn test_version_and_resources_combined() {
    let mock = MockClusterClient::with_kinds([pod_kind()]);
    mock.apply_instance(&pod_kind(), ResourceInstance::new("web", Some("default")));
    let (evaluator, _rx) = evaluator(&mock);
    let mut classifier = classifier_with_version("modern-pods", ComparisonOperator::GreaterThanOrEqualTo, "1.30.0");
    classifier.spec.deployed_resource_constraints = vec![pod_constraint()];

    assert!(!evaluator.is_match(&classifier).await);

    evaluator.set_platform_version(Some("v1.29.4".to_string()));
    assert!(!evaluator.is_match(&classifier).await);

    evaluator.set_platform_version(Some("v1.30.1".to_string()));
    assert!(evaluator.is_match(&classifier).await);
}

#[tokio::test]
async fn test_forget_reports_unmatch_for_matching_classifier() {
    let mock = MockClusterClient::new();
    let (evaluator, mut rx) = evaluator(&mock);
    let always = create_test_classifier("always", ClassifierSpec::default());
    let never = classifier_with_resources("never", vec![ResourceKind::new("x.io", "v1", "Missing")]);

    evaluator.evaluate_all(&[always.clone(), never.clone()]).await;
    assert!(rx.recv().await.unwrap().is_match);

    let result = evaluator.forget("always").unwrap();
    assert!(!result.is_match);
    assert_eq!(rx.recv().await.unwrap(), result);

    assert_eq!(evaluator.forget("never"), None);
    assert!(evaluator.snapshot().is_empty());
}

#[tokio::test]
async fn test_overlapping_evaluations_keep_latest_view() {
    let client = GatedClient::new(MockClusterClient::with_kinds([pod_kind()]));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let evaluator = Arc::new(Evaluator::new(Arc::new(client.clone()), tx));
    let classifier = classifier_with_resources("pods", vec![pod_kind()]);

    // First evaluation reads an empty cluster and is held before recording
    client.list_gate.arm();
    let earlier = tokio::spawn({
        let evaluator = Arc::clone(&evaluator);
        let classifier = classifier.clone();
        async move { evaluator.evaluate(&classifier).await }
    });
    client.list_gate.wait_entered().await;

    client.mock.apply_instance(&pod_kind(), ResourceInstance::new("web", Some("default")));
    let later = tokio::spawn({
        let evaluator = Arc::clone(&evaluator);
        let classifier = classifier.clone();
        async move { evaluator.evaluate(&classifier).await }
    });
    tokio::task::yield_now().await;
    client.list_gate.release();

    assert_eq!(earlier.await.unwrap(), None);
    assert!(later.await.unwrap().unwrap().is_match);
    assert!(evaluator.snapshot()["pods"].is_match);
    assert!(rx.recv().await.unwrap().is_match);
    assert!(rx.try_recv().is_err());
}
