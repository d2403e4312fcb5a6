//! KubewardenAddon Custom Resource Definition
//!
//! Describes a Kubewarden installation to roll out on every workload cluster
//! matched by the cluster selector.

use super::{ClusterReference, Condition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VERSION: &str = "latest";
pub const DEFAULT_IMAGE_REPOSITORY: &str = "ghcr.io/kubewarden";

/// KubewardenAddon is the Schema for the kubewardenaddons API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "addon.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "KubewardenAddon",
    namespaced,
    status = "KubewardenAddonStatus",
    shortname = "kwaddon",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubewardenAddonSpec {
    /// Selects Clusters in the same namespace. Kubewarden is installed on all of them.
    pub cluster_selector: LabelSelector,

    /// Kubewarden version to deploy ("latest" when empty)
    #[serde(default)]
    pub version: String,

    /// Registry and path the Kubewarden images are pulled from
    #[serde(default)]
    pub image_repository: String,

    /// Configuration of the default PolicyServer
    #[serde(default)]
    pub policy_server_config: PolicyServerConfig,
}

/// Configuration of the default PolicyServer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerConfig {
    /// CPU and memory requests
    #[serde(default)]
    pub resources: PolicyServerResources,

    /// Number of replicas
    #[serde(default)]
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerResources {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

impl KubewardenAddonSpec {
    /// The spec with empty fields replaced by their defaults.
    pub fn defaulted(&self) -> Self {
        let mut spec = self.clone();
        if spec.version.is_empty() {
            spec.version = DEFAULT_VERSION.to_string();
        }
        if spec.image_repository.is_empty() {
            spec.image_repository = DEFAULT_IMAGE_REPOSITORY.to_string();
        }
        spec
    }
}

/// Status of the KubewardenAddon
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubewardenAddonStatus {
    /// Whether Kubewarden is installed on every matching cluster
    #[serde(default)]
    pub ready: bool,

    /// Conditions representing the addon state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Clusters selected by the cluster selector
    #[serde(default)]
    pub matching_clusters: Vec<ClusterReference>,
}
