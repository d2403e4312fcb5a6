//! KubewardenPolicy Custom Resource Definition
//!
//! Describes one Kubewarden admission policy to deploy on every workload
//! cluster matched by the cluster selector.

use super::{ClusterReference, Condition, PolicySpec};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::admissionregistration::v1 as admissionregistration;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_POLICY_SERVER: &str = "default";

const VALID_OPERATIONS: &[&str] = &["CREATE", "UPDATE", "DELETE", "CONNECT"];
const VALID_SCOPES: &[&str] = &["", "*", "Cluster", "Namespaced"];

/// KubewardenPolicy is the Schema for the kubewardenpolicies API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "addon.cluster.x-k8s.io",
    version = "v1alpha1",
    kind = "KubewardenPolicy",
    namespaced,
    status = "KubewardenPolicyStatus",
    shortname = "kwpolicy",
    printcolumn = r#"{"name":"Policy Type","type":"string","jsonPath":".spec.policyType"}"#,
    printcolumn = r#"{"name":"Module","type":"string","jsonPath":".spec.module"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubewardenPolicySpec {
    /// Selects Clusters in the same namespace. The policy is deployed to all of them.
    pub cluster_selector: LabelSelector,

    /// Cluster-wide or namespace-scoped policy
    #[serde(default)]
    pub policy_type: PolicyType,

    /// Name of the policy on the workload cluster (resource name when empty)
    #[serde(default)]
    pub policy_name: String,

    /// Namespace of the policy on the workload cluster, required for AdmissionPolicy
    #[serde(default)]
    pub target_namespace: String,

    /// PolicyServer that evaluates the policy ("default" when empty)
    #[serde(default)]
    pub policy_server: String,

    /// Location of the policy module (registry://, https:// or file://)
    #[serde(default)]
    pub module: String,

    /// Resources and operations the policy applies to
    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    /// Whether the policy can mutate requests
    #[serde(default)]
    pub mutating: bool,

    /// Free-form policy settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub settings: Option<serde_json::Value>,

    /// How admission failures are handled (remote default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// CEL conditions gating policy evaluation
    #[serde(default)]
    pub match_conditions: Vec<MatchCondition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum PolicyType {
    #[default]
    ClusterAdmissionPolicy,
    AdmissionPolicy,
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyType::ClusterAdmissionPolicy => f.write_str("ClusterAdmissionPolicy"),
            PolicyType::AdmissionPolicy => f.write_str("AdmissionPolicy"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum FailurePolicy {
    Ignore,
    Fail,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Ignore => "Ignore",
            FailurePolicy::Fail => "Fail",
        }
    }
}

/// Resources and operations a policy applies to
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub operations: Vec<String>,
    /// "*", "Cluster" or "Namespaced"; empty means both
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl From<&PolicyRule> for admissionregistration::RuleWithOperations {
    fn from(rule: &PolicyRule) -> Self {
        admissionregistration::RuleWithOperations {
            api_groups: Some(rule.api_groups.clone()),
            api_versions: Some(rule.api_versions.clone()),
            resources: Some(rule.resources.clone()),
            operations: Some(rule.operations.clone()),
            scope: if rule.scope.is_empty() {
                None
            } else {
                Some(rule.scope.clone())
            },
        }
    }
}

impl From<&admissionregistration::RuleWithOperations> for PolicyRule {
    fn from(rule: &admissionregistration::RuleWithOperations) -> Self {
        PolicyRule {
            api_groups: rule.api_groups.clone().unwrap_or_default(),
            api_versions: rule.api_versions.clone().unwrap_or_default(),
            resources: rule.resources.clone().unwrap_or_default(),
            operations: rule.operations.clone().unwrap_or_default(),
            scope: rule.scope.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct MatchCondition {
    pub name: String,
    /// CEL expression
    pub expression: String,
}

/// Where a policy lives on a workload cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyTarget {
    ClusterScoped { name: String },
    NamespaceScoped { name: String, namespace: String },
}

impl PolicyTarget {
    pub fn name(&self) -> &str {
        match self {
            PolicyTarget::ClusterScoped { name } | PolicyTarget::NamespaceScoped { name, .. } => {
                name
            }
        }
    }

    pub fn policy_type(&self) -> PolicyType {
        match self {
            PolicyTarget::ClusterScoped { .. } => PolicyType::ClusterAdmissionPolicy,
            PolicyTarget::NamespaceScoped { .. } => PolicyType::AdmissionPolicy,
        }
    }
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyTarget::ClusterScoped { name } => write!(f, "ClusterAdmissionPolicy/{}", name),
            PolicyTarget::NamespaceScoped { name, namespace } => {
                write!(f, "AdmissionPolicy/{}/{}", namespace, name)
            }
        }
    }
}

impl KubewardenPolicySpec {
    /// The spec with empty fields replaced by their defaults.
    pub fn defaulted(&self, resource_name: &str) -> Self {
        let mut spec = self.clone();
        if spec.policy_name.is_empty() {
            spec.policy_name = resource_name.to_string();
        }
        if spec.policy_server.is_empty() {
            spec.policy_server = DEFAULT_POLICY_SERVER.to_string();
        }
        spec
    }

    /// Reject specs that can never be deployed.
    pub fn validate(&self) -> Result<()> {
        if self.module.is_empty() {
            return Err(invalid("module must be specified"));
        }
        if self.rules.is_empty() {
            return Err(invalid("at least one rule must be specified"));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.api_versions.is_empty() {
                return Err(invalid(format!("rule[{}]: apiVersions must be specified", i)));
            }
            if rule.resources.is_empty() {
                return Err(invalid(format!("rule[{}]: resources must be specified", i)));
            }
            if rule.operations.is_empty() {
                return Err(invalid(format!("rule[{}]: operations must be specified", i)));
            }
            if let Some(op) = rule
                .operations
                .iter()
                .find(|op| !VALID_OPERATIONS.contains(&op.as_str()))
            {
                return Err(invalid(format!(
                    "rule[{}]: invalid operation '{}', must be one of: {}",
                    i,
                    op,
                    VALID_OPERATIONS.join(", ")
                )));
            }
            if !VALID_SCOPES.contains(&rule.scope.as_str()) {
                return Err(invalid(format!(
                    "rule[{}]: invalid scope '{}'",
                    i, rule.scope
                )));
            }
        }
        if self.policy_type == PolicyType::AdmissionPolicy && self.target_namespace.is_empty() {
            return Err(invalid("targetNamespace must be specified for AdmissionPolicy"));
        }
        Ok(())
    }

    /// Key of the remote policy object. Call on a defaulted spec.
    pub fn target(&self) -> PolicyTarget {
        match self.policy_type {
            PolicyType::ClusterAdmissionPolicy => PolicyTarget::ClusterScoped {
                name: self.policy_name.clone(),
            },
            PolicyType::AdmissionPolicy => PolicyTarget::NamespaceScoped {
                name: self.policy_name.clone(),
                namespace: self.target_namespace.clone(),
            },
        }
    }

    /// Build the spec of the Kubewarden policy object.
    pub fn to_policy_spec(&self) -> PolicySpec {
        PolicySpec {
            policy_server: self.policy_server.clone(),
            module: self.module.clone(),
            rules: self.rules.iter().map(Into::into).collect(),
            failure_policy: self.failure_policy.map(|fp| fp.as_str().to_string()),
            mutating: self.mutating,
            settings: self.settings.clone().filter(|s| !is_empty_settings(s)),
            match_conditions: self
                .match_conditions
                .iter()
                .map(|mc| admissionregistration::MatchCondition {
                    name: mc.name.clone(),
                    expression: mc.expression.clone(),
                })
                .collect(),
            unmanaged: Default::default(),
        }
    }
}

fn is_empty_settings(settings: &serde_json::Value) -> bool {
    match settings {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn invalid(msg: impl Into<String>) -> OperatorError {
    OperatorError::InvalidSpec(msg.into())
}

/// Status of the KubewardenPolicy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubewardenPolicyStatus {
    /// Whether the policy is active on every matching cluster
    #[serde(default)]
    pub ready: bool,

    /// Conditions representing the policy state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Clusters selected by the cluster selector
    #[serde(default)]
    pub matching_clusters: Vec<ClusterReference>,

    /// Per-cluster deployment records
    #[serde(default)]
    pub deployed_policies: Vec<DeployedPolicyStatus>,
}

/// Deployment record of the policy on one workload cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployedPolicyStatus {
    pub cluster_name: String,
    pub cluster_namespace: String,
    pub policy_name: String,
    pub policy_type: PolicyType,
    pub active: bool,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}
