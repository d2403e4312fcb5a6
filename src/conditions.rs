//! Kubernetes-standard status condition helpers
//!
//! Condition types and reasons used by the KubewardenAddon and
//! KubewardenPolicy status, plus builders that keep `lastTransitionTime`
//! stable while a condition's status does not change.

use crate::crd::Condition;
use chrono::Utc;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// Summary condition, true when every other owned condition is true
pub const CONDITION_READY: &str = "Ready";

// KubewardenAddon condition types
pub const ADDON_SPECS_UP_TO_DATE: &str = "KubewardenAddonSpecsUpToDate";
pub const ADDON_READY: &str = "KubewardenAddonReady";

// KubewardenPolicy condition types
pub const POLICY_SPECS_UP_TO_DATE: &str = "KubewardenPolicySpecsUpToDate";
pub const POLICY_DEPLOYED: &str = "KubewardenPolicyDeployed";

// Reasons
pub const REASON_SPECS_UPDATING: &str = "KubewardenAddonSpecsUpdating";
pub const REASON_CREATION_FAILED: &str = "KubewardenAddonCreationFailed";
pub const REASON_REINSTALLING: &str = "KubewardenAddonReinstalling";
pub const REASON_CLUSTER_PAUSED: &str = "ClusterPaused";
pub const REASON_CLUSTER_SELECTION_FAILED: &str = "ClusterSelectionFailed";
pub const REASON_WAITING_FOR_CONTROL_PLANE: &str = "WaitingForControlPlane";
pub const REASON_INSTALLED: &str = "Installed";
pub const REASON_NO_MATCHING_CLUSTERS: &str = "NoMatchingClusters";
pub const REASON_SPECS_VALID: &str = "SpecsValid";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
pub const REASON_POLICY_ACTIVE: &str = "PolicyActive";
pub const REASON_POLICY_PENDING: &str = "PolicyPending";
pub const REASON_POLICY_DEPLOY_FAILED: &str = "PolicyDeploymentFailed";

// Finalizer names
pub const POLICY_FINALIZER: &str = "kubewardenpolicy.addon.cluster.x-k8s.io/cleanup";

/// Build a condition with the current timestamp.
pub fn build_condition(condition_type: &str, status: &str, reason: &str, message: &str) -> Condition {
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

pub fn true_condition(condition_type: &str, reason: &str, message: &str) -> Condition {
    build_condition(condition_type, CONDITION_TRUE, reason, message)
}

pub fn false_condition(condition_type: &str, reason: &str, message: &str) -> Condition {
    build_condition(condition_type, CONDITION_FALSE, reason, message)
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

pub fn is_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.r#type == condition_type && c.status == CONDITION_TRUE)
}

/// Set the `Ready` summary from the given condition types.
///
/// Ready mirrors the first listed condition that is not true, or is true
/// when all of them are. Missing conditions count as Unknown.
pub fn set_summary(conditions: &mut Vec<Condition>, owned: &[&str]) {
    let blocking = owned.iter().find_map(|t| {
        match conditions.iter().find(|c| c.r#type == *t) {
            Some(c) if c.status == CONDITION_TRUE => None,
            Some(c) => Some((
                c.status.clone(),
                c.reason.clone().unwrap_or_default(),
                c.message.clone().unwrap_or_default(),
            )),
            None => Some((
                CONDITION_UNKNOWN.to_string(),
                String::new(),
                format!("{} not reported", t),
            )),
        }
    });

    let summary = match blocking {
        None => true_condition(CONDITION_READY, CONDITION_READY, ""),
        Some((status, reason, message)) => {
            build_condition(CONDITION_READY, &status, &reason, &message)
        }
    };
    set_condition(conditions, summary);
}
