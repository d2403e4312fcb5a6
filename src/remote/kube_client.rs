//! `kube` backed workload cluster clients
//!
//! Cluster API stores the admin kubeconfig of every workload cluster in the
//! Secret `<cluster>-kubeconfig` (key `value`) next to the Cluster object.

use super::{CreateOutcome, RemoteClient, RemoteClientProvider, RemotePolicy};
use crate::crd::{
    AdmissionPolicy, AdmissionPolicySpec, ClusterAdmissionPolicy, ClusterAdmissionPolicySpec,
    ClusterReference, PolicySpec, PolicyTarget,
};
use crate::error::{OperatorError, Result};
use crate::install::Manifest;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, Config};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const KUBECONFIG_SECRET_KEY: &str = "value";
const DEFAULT_NAMESPACE: &str = "default";

/// Builds workload cluster clients from the CAPI kubeconfig Secrets.
pub struct KubeconfigSecretProvider {
    client: Client,
    connect_timeout: Duration,
    read_timeout: Duration,
    field_manager: String,
}

impl KubeconfigSecretProvider {
    pub fn new(
        client: Client,
        connect_timeout: Duration,
        read_timeout: Duration,
        field_manager: &str,
    ) -> Self {
        Self {
            client,
            connect_timeout,
            read_timeout,
            field_manager: field_manager.to_string(),
        }
    }

    async fn kubeconfig(&self, cluster: &ClusterReference) -> Result<Kubeconfig> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &cluster.namespace);
        let secret_name = format!("{}-kubeconfig", cluster.name);
        let secret = secrets
            .get_opt(&secret_name)
            .await
            .map_err(|e| OperatorError::remote_client(&cluster.name, e))?
            .ok_or_else(|| {
                OperatorError::remote_client(
                    &cluster.name,
                    format!("kubeconfig secret {} not found", secret_name),
                )
            })?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                OperatorError::remote_client(
                    &cluster.name,
                    format!("secret {} has no '{}' key", secret_name, KUBECONFIG_SECRET_KEY),
                )
            })?;
        let yaml = std::str::from_utf8(&raw.0)
            .map_err(|e| OperatorError::remote_client(&cluster.name, e))?;

        Kubeconfig::from_yaml(yaml).map_err(|e| OperatorError::remote_client(&cluster.name, e))
    }
}

#[async_trait]
impl RemoteClientProvider for KubeconfigSecretProvider {
    async fn for_cluster(&self, cluster: &ClusterReference) -> Result<Arc<dyn RemoteClient>> {
        let kubeconfig = self.kubeconfig(cluster).await?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| OperatorError::remote_client(&cluster.name, e))?;
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);
        let client =
            Client::try_from(config).map_err(|e| OperatorError::remote_client(&cluster.name, e))?;

        debug!(cluster = %cluster.name, "Built workload cluster client");
        Ok(Arc::new(KubeRemoteClient::new(client, &self.field_manager)))
    }
}

pub struct KubeRemoteClient {
    client: Client,
    post_params: PostParams,
}

impl KubeRemoteClient {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            post_params: PostParams {
                field_manager: Some(field_manager.to_string()),
                ..Default::default()
            },
        }
    }

    fn cluster_policies(&self) -> Api<ClusterAdmissionPolicy> {
        Api::all(self.client.clone())
    }

    fn namespaced_policies(&self, namespace: &str) -> Api<AdmissionPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[async_trait]
impl RemoteClient for KubeRemoteClient {
    async fn create(&self, manifest: &Manifest) -> Result<CreateOutcome> {
        let (resource, capabilities) = pinned_kind(&self.client, manifest.gvk()).await?;
        let api: Api<DynamicObject> = match capabilities.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                manifest.namespace().unwrap_or(DEFAULT_NAMESPACE),
                &resource,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        };

        match api.create(&self.post_params, manifest.object()).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_policy(&self, target: &PolicyTarget) -> Result<Option<RemotePolicy>> {
        let policy = match target {
            PolicyTarget::ClusterScoped { name } => {
                self.cluster_policies().get_opt(name).await?.map(|p| RemotePolicy {
                    metadata: p.metadata,
                    spec: p.spec.policy,
                    status: p.status,
                })
            }
            PolicyTarget::NamespaceScoped { name, namespace } => self
                .namespaced_policies(namespace)
                .get_opt(name)
                .await?
                .map(|p| RemotePolicy {
                    metadata: p.metadata,
                    spec: p.spec.policy,
                    status: p.status,
                }),
        };
        Ok(policy)
    }

    async fn create_policy(&self, target: &PolicyTarget, spec: &PolicySpec) -> Result<()> {
        match target {
            PolicyTarget::ClusterScoped { name } => {
                let policy = ClusterAdmissionPolicy::new(
                    name,
                    ClusterAdmissionPolicySpec {
                        policy: spec.clone(),
                    },
                );
                self.cluster_policies()
                    .create(&self.post_params, &policy)
                    .await?;
            }
            PolicyTarget::NamespaceScoped { name, namespace } => {
                let mut policy = AdmissionPolicy::new(
                    name,
                    AdmissionPolicySpec {
                        policy: spec.clone(),
                    },
                );
                policy.metadata.namespace = Some(namespace.clone());
                self.namespaced_policies(namespace)
                    .create(&self.post_params, &policy)
                    .await?;
            }
        }
        Ok(())
    }

    async fn update_policy(
        &self,
        target: &PolicyTarget,
        existing: &RemotePolicy,
        spec: &PolicySpec,
    ) -> Result<()> {
        match target {
            PolicyTarget::ClusterScoped { name } => {
                let policy = ClusterAdmissionPolicy {
                    metadata: existing.metadata.clone(),
                    spec: ClusterAdmissionPolicySpec {
                        policy: spec.clone(),
                    },
                    status: None,
                };
                self.cluster_policies()
                    .replace(name, &self.post_params, &policy)
                    .await?;
            }
            PolicyTarget::NamespaceScoped { name, namespace } => {
                let policy = AdmissionPolicy {
                    metadata: existing.metadata.clone(),
                    spec: AdmissionPolicySpec {
                        policy: spec.clone(),
                    },
                    status: None,
                };
                self.namespaced_policies(namespace)
                    .replace(name, &self.post_params, &policy)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_policy(&self, target: &PolicyTarget) -> Result<bool> {
        let result = match target {
            PolicyTarget::ClusterScoped { name } => self
                .cluster_policies()
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
            PolicyTarget::NamespaceScoped { name, namespace } => self
                .namespaced_policies(namespace)
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
