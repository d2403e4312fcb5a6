//! Workload cluster access
//!
//! A [`RemoteClientProvider`] turns a Cluster API cluster reference into a
//! [`RemoteClient`] scoped to that workload cluster. The reconcilers never
//! touch `kube::Client` for workload clusters directly.

mod kube_client;

pub use kube_client::{KubeRemoteClient, KubeconfigSecretProvider};

use crate::crd::{ClusterReference, PolicySpec, PolicyStatus, PolicyTarget};
use crate::error::{OperatorError, Result};
use crate::install::Manifest;
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Result of a create-only write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// A Kubewarden policy as read back from a workload cluster
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePolicy {
    /// Metadata as stored, so an update keeps labels, owners and finalizers.
    pub metadata: ObjectMeta,
    pub spec: PolicySpec,
    pub status: Option<PolicyStatus>,
}

impl RemotePolicy {
    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.status.as_ref().is_some_and(PolicyStatus::is_active)
    }
}

/// Operations the provider performs on one workload cluster.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Create the object unless it already exists. Existing objects are left untouched.
    async fn create(&self, manifest: &Manifest) -> Result<CreateOutcome>;

    async fn get_policy(&self, target: &PolicyTarget) -> Result<Option<RemotePolicy>>;

    async fn create_policy(&self, target: &PolicyTarget, spec: &PolicySpec) -> Result<()>;

    /// Write `spec` onto `existing`, keeping its metadata. Fails with `Conflict` when it changed since it was read.
    async fn update_policy(
        &self,
        target: &PolicyTarget,
        existing: &RemotePolicy,
        spec: &PolicySpec,
    ) -> Result<()>;

    /// Delete the policy. Returns false when it was already gone.
    async fn delete_policy(&self, target: &PolicyTarget) -> Result<bool>;
}

#[async_trait]
pub trait RemoteClientProvider: Send + Sync {
    async fn for_cluster(&self, cluster: &ClusterReference) -> Result<Arc<dyn RemoteClient>>;
}

/// Bound a remote call, turning an elapsed deadline into `OperatorError::Timeout`.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(OperatorError::Timeout(format!("{} after {:?}", what, limit))),
    }
}
