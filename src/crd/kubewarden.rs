//! Kubewarden policy kinds created on workload clusters
//!
//! `ClusterAdmissionPolicy` is cluster-scoped, `AdmissionPolicy` is namespaced.
//! Both share the same policy spec and report activation through
//! `status.policyStatus`.

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value of `status.policyStatus` once the policy server enforces the policy
pub const POLICY_STATUS_ACTIVE: &str = "active";

/// Spec fields common to both Kubewarden policy kinds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub policy_server: String,

    pub module: String,

    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<String>,

    #[serde(default)]
    pub mutating: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "super::preserve_unknown_fields")]
    pub settings: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<MatchCondition>,

    /// Spec fields the provider does not manage (`backgroundAudit`, `mode`, ...), kept as read.
    #[serde(flatten)]
    #[schemars(skip)]
    pub unmanaged: Map<String, Value>,
}

impl PolicySpec {
    /// Whether the managed fields already hold what `desired` asks for.
    ///
    /// Fields `desired` leaves unset (failure policy, rule scope) are the
    /// server's to default and are not compared. Settings and match
    /// conditions are compared exactly so removals are picked up.
    pub fn satisfies(&self, desired: &PolicySpec) -> bool {
        if normalized_settings(&self.settings) != normalized_settings(&desired.settings)
            || self.match_conditions != desired.match_conditions
        {
            return false;
        }
        let managed = PolicySpec {
            settings: None,
            match_conditions: Vec::new(),
            unmanaged: Map::new(),
            ..self.clone()
        };
        let wanted = PolicySpec {
            settings: None,
            match_conditions: Vec::new(),
            unmanaged: Map::new(),
            ..desired.clone()
        };
        match (serde_json::to_value(managed), serde_json::to_value(wanted)) {
            (Ok(current), Ok(wanted)) => contains(&current, &wanted),
            _ => false,
        }
    }

    /// This spec with the managed fields taken from `desired`.
    pub fn with_managed_fields(&self, desired: &PolicySpec) -> PolicySpec {
        PolicySpec {
            failure_policy: desired
                .failure_policy
                .clone()
                .or_else(|| self.failure_policy.clone()),
            unmanaged: self.unmanaged.clone(),
            ..desired.clone()
        }
    }
}

fn normalized_settings(settings: &Option<Value>) -> Option<&Value> {
    settings
        .as_ref()
        .filter(|s| !s.is_null() && s.as_object().map_or(true, |m| !m.is_empty()))
}

/// Every field present in `wanted` has the same value in `current`.
fn contains(current: &Value, wanted: &Value) -> bool {
    match (current, wanted) {
        (Value::Object(current), Value::Object(wanted)) => wanted
            .iter()
            .all(|(key, value)| current.get(key).is_some_and(|c| contains(c, value))),
        (Value::Array(current), Value::Array(wanted)) => {
            current.len() == wanted.len() && current.iter().zip(wanted).all(|(c, w)| contains(c, w))
        }
        _ => current == wanted,
    }
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicy",
    status = "PolicyStatus"
)]
pub struct ClusterAdmissionPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicy",
    namespaced,
    status = "PolicyStatus"
)]
pub struct AdmissionPolicySpec {
    #[serde(flatten)]
    pub policy: PolicySpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub policy_status: Option<String>,

    #[serde(default)]
    pub mode: Option<String>,
}

impl PolicyStatus {
    pub fn is_active(&self) -> bool {
        self.policy_status.as_deref() == Some(POLICY_STATUS_ACTIVE)
    }
}
