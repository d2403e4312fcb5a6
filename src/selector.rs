//! Label selector evaluation against workload clusters
//!
//! Implements the Kubernetes label selector semantics: every `matchLabels`
//! pair and every `matchExpressions` requirement must hold. An empty selector
//! (`{}`) matches every candidate, as it does for the API server.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;

const OP_IN: &str = "In";
const OP_NOT_IN: &str = "NotIn";
const OP_EXISTS: &str = "Exists";
const OP_DOES_NOT_EXIST: &str = "DoesNotExist";

/// A selector that cannot be evaluated
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("requirement with an empty key")]
    EmptyKey,

    #[error("operator {operator} on key {key} requires at least one value")]
    MissingValues { key: String, operator: String },

    #[error("operator {operator} on key {key} must not have values")]
    UnexpectedValues { key: String, operator: String },

    #[error("unknown operator {operator} on key {key}")]
    UnknownOperator { key: String, operator: String },
}

/// Check that every requirement of the selector is well formed.
pub fn validate(selector: &LabelSelector) -> Result<(), SelectorError> {
    for req in selector.match_expressions.iter().flatten() {
        validate_requirement(req)?;
    }
    Ok(())
}

fn validate_requirement(req: &LabelSelectorRequirement) -> Result<(), SelectorError> {
    if req.key.is_empty() {
        return Err(SelectorError::EmptyKey);
    }
    let has_values = req.values.as_ref().is_some_and(|v| !v.is_empty());
    match req.operator.as_str() {
        OP_IN | OP_NOT_IN if !has_values => Err(SelectorError::MissingValues {
            key: req.key.clone(),
            operator: req.operator.clone(),
        }),
        OP_EXISTS | OP_DOES_NOT_EXIST if has_values => Err(SelectorError::UnexpectedValues {
            key: req.key.clone(),
            operator: req.operator.clone(),
        }),
        OP_IN | OP_NOT_IN | OP_EXISTS | OP_DOES_NOT_EXIST => Ok(()),
        _ => Err(SelectorError::UnknownOperator {
            key: req.key.clone(),
            operator: req.operator.clone(),
        }),
    }
}

/// Evaluate the selector against a label set.
pub fn matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    validate(selector)?;

    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }

    for req in selector.match_expressions.iter().flatten() {
        if !requirement_matches(req, labels) {
            return Ok(false);
        }
    }

    Ok(true)
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let label_value = labels.get(&req.key);
    let values = req.values.as_deref().unwrap_or_default();

    match req.operator.as_str() {
        OP_IN => label_value.is_some_and(|v| values.contains(v)),
        OP_NOT_IN => !label_value.is_some_and(|v| values.contains(v)),
        OP_EXISTS => label_value.is_some(),
        OP_DOES_NOT_EXIST => label_value.is_none(),
        _ => false,
    }
}

/// Return the candidates whose labels satisfy the selector, in input order.
pub fn select<'a, K>(selector: &LabelSelector, candidates: &'a [K]) -> Result<Vec<&'a K>, SelectorError>
where
    K: Resource,
{
    validate(selector)?;
    let mut selected = Vec::new();
    for candidate in candidates {
        if matches(selector, candidate.labels())? {
            selected.push(candidate);
        }
    }
    Ok(selected)
}
