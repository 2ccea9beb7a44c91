//! Desired watch set computation.

use crate::classifier_source::ClassifierSource;
use crate::error::ControllerError;
use cluster_client::ResourceKind;
use crds::{ClassifierSpec, DeployedResourceConstraint};
use std::collections::{HashMap, HashSet};

/// Kind a resource constraint refers to
#[must_use]
pub fn resource_kind_of(constraint: &DeployedResourceConstraint) -> ResourceKind {
    ResourceKind::new(&constraint.group, &constraint.version, &constraint.kind)
}

/// Returns true if any resource constraint of `spec` refers to `kind`.
#[must_use]
pub fn references_kind(spec: &ClassifierSpec, kind: &ResourceKind) -> bool {
    spec.deployed_resource_constraints
        .iter()
        .any(|c| &resource_kind_of(c) == kind)
}

/// Union of every kind referenced by a resource constraint.
pub fn build_desired_set<'a>(specs: impl IntoIterator<Item = &'a ClassifierSpec>) -> HashMap<ResourceKind, bool> {
    specs
        .into_iter()
        .flat_map(|spec| spec.deployed_resource_constraints.iter())
        .map(|constraint| (resource_kind_of(constraint), true))
        .collect()
}

/// Kinds of the set ordered by kind, then group, then version.
#[must_use]
pub fn build_sorted_list(set: &HashMap<ResourceKind, bool>) -> Vec<ResourceKind> {
    let mut kinds: Vec<ResourceKind> = set.keys().cloned().collect();
    kinds.sort();
    kinds
}

/// Exact, case-sensitive membership test.
#[must_use]
pub fn gvk_installed(kind: &ResourceKind, installed: &HashSet<ResourceKind>) -> bool {
    installed.contains(kind)
}

/// Lists classifiers and returns the kinds they reference.
pub async fn build_list(source: &dyn ClassifierSource) -> Result<HashMap<ResourceKind, bool>, ControllerError> {
    let classifiers = source.list_classifiers().await?;
    Ok(build_desired_set(classifiers.iter().map(|c| &c.spec)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{classifier_with_resources, pod_kind, StaticClassifierSource};

    fn kubeadm_kind() -> ResourceKind {
        ResourceKind::new("bootstrap.cluster.x-k8s.io", "v1beta1", "Kubeadmconfig")
    }

    fn spec_for(kinds: &[ResourceKind]) -> ClassifierSpec {
        ClassifierSpec {
            deployed_resource_constraints: kinds
                .iter()
                .map(|k| DeployedResourceConstraint::new(&k.group, &k.version, &k.kind))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_desired_set_is_union_without_duplicates() {
        let specs = vec![
            spec_for(&[pod_kind(), kubeadm_kind()]),
            spec_for(&[pod_kind()]),
            spec_for(&[]),
        ];

        let set = build_desired_set(&specs);
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&pod_kind()), Some(&true));
        assert_eq!(set.get(&kubeadm_kind()), Some(&true));
    }

    #[test]
    fn test_sorted_list_independent_of_insertion_order() {
        let deployment = ResourceKind::new("apps", "v1", "Deployment");
        let orders = [
            vec![pod_kind(), kubeadm_kind(), deployment.clone()],
            vec![deployment.clone(), pod_kind(), kubeadm_kind()],
            vec![kubeadm_kind(), deployment.clone(), pod_kind()],
        ];

        let lists: Vec<Vec<ResourceKind>> = orders
            .iter()
            .map(|order| build_sorted_list(&build_desired_set([&spec_for(order)])))
            .collect();

        assert_eq!(lists[0], vec![deployment, kubeadm_kind(), pod_kind()]);
        assert_eq!(lists[0], lists[1]);
        assert_eq!(lists[1], lists[2]);
    }

    #[test]
    fn test_gvk_installed_is_exact() {
        let installed = HashSet::from([pod_kind(), kubeadm_kind()]);

        assert!(gvk_installed(&pod_kind(), &installed));
        assert!(gvk_installed(&kubeadm_kind(), &installed));
        assert!(!gvk_installed(
            &ResourceKind::new("lib.projectsveltos.io", "v1alpha1", "debuggingconfigurations"),
            &installed
        ));
        assert!(!gvk_installed(&ResourceKind::new("", "v1", "pod"), &installed));
    }

    #[tokio::test]
    async fn test_build_list_from_source() {
        let source = StaticClassifierSource::new(vec![
            classifier_with_resources("pods", vec![pod_kind()]),
            classifier_with_resources("kubeadm", vec![kubeadm_kind(), pod_kind()]),
        ]);

        let set = build_list(&source).await.unwrap();
        assert_eq!(build_sorted_list(&set), vec![kubeadm_kind(), pod_kind()]);
    }

    #[tokio::test]
    async fn test_build_list_propagates_list_errors() {
        let source = StaticClassifierSource::new(vec![]);
        source.fail_with("classifiers unavailable");

        let err = build_list(&source).await.unwrap_err();
        assert!(matches!(err, ControllerError::List(_)));
    }
}
