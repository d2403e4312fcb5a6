//! Management cluster access
//!
//! The reconcilers read Cluster API clusters and write back to their own
//! resources only through these traits, so they can run against in-memory
//! stores in tests. The `Kube*` implementations talk to the API server.

use crate::crd::Cluster;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::debug;

/// Read access to CAPI clusters plus the one write the provider makes on them.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Clusters in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<Cluster>>;

    /// Set one annotation with a merge patch, leaving every other annotation alone.
    async fn annotate(&self, cluster: &Cluster, key: &str, value: &str) -> Result<()>;
}

/// Status of a resource as currently stored by the API server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveStatus {
    pub resource_version: Option<String>,
    pub status: Option<Value>,
}

/// Writes the reconcilers make on their own resources.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Read the status subresource as it is now, bypassing any cached copy.
    async fn live_status(&self, obj: &K) -> Result<LiveStatus>;

    /// Apply a merge patch to the status subresource.
    async fn patch_status(&self, obj: &K, patch: &Value) -> Result<()>;

    async fn add_finalizer(&self, obj: &K, finalizer: &str) -> Result<()>;

    async fn remove_finalizer(&self, obj: &K, finalizer: &str) -> Result<()>;
}

/// Merge patch setting a single annotation.
pub fn annotation_patch(key: &str, value: &str) -> Value {
    json!({
        "metadata": {
            "annotations": {
                key: value
            }
        }
    })
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Finalizer list with one entry added or removed, keeping the others.
fn finalizers_with<K: Resource>(obj: &K, finalizer: &str, present: bool) -> Vec<String> {
    let mut finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    if present {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

pub struct KubeClusterStore {
    client: Client,
    patch_params: PatchParams,
}

impl KubeClusterStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_string()),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn list(&self, namespace: &str) -> Result<Vec<Cluster>> {
        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), namespace);
        let list = clusters.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn annotate(&self, cluster: &Cluster, key: &str, value: &str) -> Result<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), &namespace);
        clusters
            .patch(
                &cluster.name_any(),
                &self.patch_params,
                &Patch::Merge(&annotation_patch(key, value)),
            )
            .await?;
        debug!(cluster = %cluster.name_any(), annotation = key, "Annotated cluster");
        Ok(())
    }
}

/// Store for a namespaced custom resource owned by the provider.
pub struct KubeResourceStore<K> {
    client: Client,
    patch_params: PatchParams,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeResourceStore<K> {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_string()),
                ..Default::default()
            },
            _kind: PhantomData,
        }
    }
}

impl<K> KubeResourceStore<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    fn api_for(&self, obj: &K) -> Api<K> {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }

    async fn patch_finalizers(&self, obj: &K, finalizers: Vec<String>) -> Result<()> {
        let patch = json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.api_for(obj)
            .patch(&obj.name_any(), &self.patch_params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeResourceStore<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug
        + Serialize
        + Send
        + Sync,
{
    async fn live_status(&self, obj: &K) -> Result<LiveStatus> {
        let current = self.api_for(obj).get_status(&obj.name_any()).await?;
        let status = serde_json::to_value(&current)?
            .get("status")
            .filter(|s| !s.is_null())
            .cloned();
        Ok(LiveStatus {
            resource_version: current.resource_version(),
            status,
        })
    }

    async fn patch_status(&self, obj: &K, patch: &Value) -> Result<()> {
        self.api_for(obj)
            .patch_status(&obj.name_any(), &self.patch_params, &Patch::Merge(patch))
            .await
            .map_err(|e| OperatorError::StatusPatch(e.to_string()))?;
        Ok(())
    }

    async fn add_finalizer(&self, obj: &K, finalizer: &str) -> Result<()> {
        if has_finalizer(obj, finalizer) {
            return Ok(());
        }
        self.patch_finalizers(obj, finalizers_with(obj, finalizer, true))
            .await
    }

    async fn remove_finalizer(&self, obj: &K, finalizer: &str) -> Result<()> {
        if !has_finalizer(obj, finalizer) {
            return Ok(());
        }
        self.patch_finalizers(obj, finalizers_with(obj, finalizer, false))
            .await
    }
}
