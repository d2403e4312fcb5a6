//! Cluster API `Cluster` as seen by the addon provider
//!
//! Only the fields the provider reads are declared; everything else the
//! Cluster API controllers store on the object is ignored when decoding.

use super::ClusterReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const CONTROL_PLANE_READY_CONDITION: &str = "ControlPlaneReady";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub control_plane_ready: bool,

    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

/// Cluster API condition (carries a severity besides the usual fields)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl Cluster {
    /// The control plane is ready when the status flag or the ControlPlaneReady condition says so.
    pub fn control_plane_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.control_plane_ready
                || s.conditions
                    .iter()
                    .any(|c| c.r#type == CONTROL_PLANE_READY_CONDITION && c.status == "True")
        })
    }

    /// Paused clusters are left alone until Cluster API resumes them.
    pub fn is_paused(&self) -> bool {
        self.spec.paused
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations().contains_key(key)
    }

    pub fn reference(&self) -> ClusterReference {
        ClusterReference {
            api_version: Cluster::api_version(&()).to_string(),
            kind: Cluster::kind(&()).to_string(),
            name: self.name_any(),
            namespace: self.namespace().unwrap_or_default(),
        }
    }
}
