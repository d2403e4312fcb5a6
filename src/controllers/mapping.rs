//! Cluster change propagation
//!
//! When a CAPI Cluster changes, every addon or policy in the same namespace
//! whose selector matches it (or whose status still lists it) is queued for
//! reconciliation.

use crate::crd::{Cluster, ClusterReference, KubewardenAddon, KubewardenPolicy};
use crate::selector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::warn;

/// A resource that targets workload clusters through a label selector.
pub trait ClusterSelecting: Resource<DynamicType = ()> {
    fn cluster_selector(&self) -> &LabelSelector;

    /// Clusters the last reconcile recorded as matching.
    fn recorded_clusters(&self) -> &[ClusterReference];
}

impl ClusterSelecting for KubewardenAddon {
    fn cluster_selector(&self) -> &LabelSelector {
        &self.spec.cluster_selector
    }

    fn recorded_clusters(&self) -> &[ClusterReference] {
        self.status
            .as_ref()
            .map(|s| s.matching_clusters.as_slice())
            .unwrap_or_default()
    }
}

impl ClusterSelecting for KubewardenPolicy {
    fn cluster_selector(&self) -> &LabelSelector {
        &self.spec.cluster_selector
    }

    fn recorded_clusters(&self) -> &[ClusterReference] {
        self.status
            .as_ref()
            .map(|s| s.matching_clusters.as_slice())
            .unwrap_or_default()
    }
}

/// Resources to reconcile after `cluster` changed.
///
/// A resource with a malformed selector is skipped and does not stop the
/// others from being queued.
pub fn resources_for_cluster<K>(cluster: &Cluster, resources: &[Arc<K>]) -> Vec<ObjectRef<K>>
where
    K: ClusterSelecting,
{
    let cluster_name = cluster.name_any();
    let cluster_namespace = cluster.namespace();

    resources
        .iter()
        .filter(|resource| resource.namespace() == cluster_namespace)
        .filter(|resource| {
            match selector::matches(resource.cluster_selector(), cluster.labels()) {
                Ok(true) => true,
                Ok(false) => resource
                    .recorded_clusters()
                    .iter()
                    .any(|c| c.name == cluster_name),
                Err(e) => {
                    warn!(
                        resource = %resource.name_any(),
                        cluster = %cluster_name,
                        "Skipping resource with invalid cluster selector: {}",
                        e
                    );
                    false
                }
            }
        })
        .map(|resource| ObjectRef::from_obj(resource.as_ref()))
        .collect()
}
