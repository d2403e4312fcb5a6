//! Kubewarden Addon Provider
//!
//! A Cluster API addon provider that installs Kubewarden on workload clusters
//! and deploys Kubewarden admission policies to them.
//!
//! ## Custom Resources
//!
//! - `KubewardenAddon`: Installs Kubewarden on every Cluster matched by its selector
//! - `KubewardenPolicy`: Deploys one ClusterAdmissionPolicy or AdmissionPolicy to the matched Clusters
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: addon.cluster.x-k8s.io/v1alpha1
//! kind: KubewardenAddon
//! metadata:
//!   name: kubewarden
//!   namespace: default
//! spec:
//!   clusterSelector:
//!     matchLabels:
//!       environment: production
//!   version: v1.17.0
//!   policyServerConfig:
//!     replicas: 2
//! ```

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod install;
pub mod leader_election;
pub mod patch;
pub mod remote;
pub mod selector;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ProviderConfig;
pub use controllers::{AddonController, AddonReconciler, PolicyController, PolicyReconciler};
pub use crd::{
    Cluster, ClusterReference, Condition, DeployedPolicyStatus, KubewardenAddon,
    KubewardenAddonSpec, KubewardenAddonStatus, KubewardenPolicy, KubewardenPolicySpec,
    KubewardenPolicyStatus, PolicyTarget, PolicyType,
};
pub use error::{OperatorError, Result};
