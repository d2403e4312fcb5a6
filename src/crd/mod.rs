//! Custom Resource Definitions for the Kubewarden addon provider
//!
//! Owned by the provider:
//! - KubewardenAddon: installs Kubewarden on the selected workload clusters
//! - KubewardenPolicy: deploys one admission policy to the selected workload clusters
//!
//! Read from other controllers:
//! - Cluster (Cluster API)
//! - ClusterAdmissionPolicy / AdmissionPolicy (Kubewarden, on workload clusters)

mod addon;
mod capi;
mod kubewarden;
mod policy;

pub use addon::{
    KubewardenAddon, KubewardenAddonSpec, KubewardenAddonStatus, PolicyServerConfig,
    PolicyServerResources, DEFAULT_IMAGE_REPOSITORY, DEFAULT_VERSION,
};
pub use capi::{Cluster, ClusterCondition, ClusterSpec, ClusterStatus};
pub use kubewarden::{
    AdmissionPolicy, AdmissionPolicySpec, ClusterAdmissionPolicy, ClusterAdmissionPolicySpec,
    PolicySpec, PolicyStatus, POLICY_STATUS_ACTIVE,
};
pub use policy::{
    DeployedPolicyStatus, FailurePolicy, KubewardenPolicy, KubewardenPolicySpec,
    KubewardenPolicyStatus, MatchCondition, PolicyRule, PolicyTarget, PolicyType,
    DEFAULT_POLICY_SERVER,
};

use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition of an addon or policy resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

/// Reference to a Cluster API cluster selected by a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// Schema for free-form JSON objects (policy settings)
pub(crate) fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
