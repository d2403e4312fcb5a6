//! Untyped Kubernetes objects decoded from YAML streams
//!
//! Chart output and CRD bundles are multi-document YAML. Each document is
//! decoded into a [`DynamicObject`] and paired with its group/version/kind so
//! the remote client can discover where to create it.

use crate::error::{OperatorError, Result};
use kube::api::{DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct Manifest {
    object: DynamicObject,
    gvk: GroupVersionKind,
    default_namespace: Option<String>,
}

impl Manifest {
    /// Decode one JSON object. `apiVersion`, `kind` and `metadata.name` are required.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let object: DynamicObject = serde_json::from_value(value)
            .map_err(|e| OperatorError::Manifest(format!("invalid object: {}", e)))?;

        let types = object
            .types
            .as_ref()
            .ok_or_else(|| OperatorError::Manifest("object without apiVersion/kind".to_string()))?;
        if types.kind.is_empty() {
            return Err(OperatorError::Manifest("object without kind".to_string()));
        }
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", types.api_version.as_str()),
        };
        if version.is_empty() {
            return Err(OperatorError::Manifest(format!(
                "{} without apiVersion",
                types.kind
            )));
        }
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);

        if object.metadata.name.as_deref().unwrap_or_default().is_empty() {
            return Err(OperatorError::Manifest(format!(
                "{} without metadata.name",
                gvk.kind
            )));
        }

        Ok(Self {
            object,
            gvk,
            default_namespace: None,
        })
    }

    /// Decode a multi-document YAML stream, skipping empty documents.
    pub fn parse_stream(yaml: &str) -> Result<Vec<Self>> {
        let mut manifests = Vec::new();
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| OperatorError::Manifest(format!("invalid YAML: {}", e)))?;
            if value.is_null() {
                continue;
            }
            let value = serde_json::to_value(value)
                .map_err(|e| OperatorError::Manifest(format!("unsupported YAML: {}", e)))?;
            manifests.push(Self::from_value(value)?);
        }
        Ok(manifests)
    }

    /// A `v1/Namespace` object.
    pub fn namespace_object(name: &str) -> Result<Self> {
        Self::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name }
        }))
    }

    /// Namespace used for namespaced objects that do not set one.
    pub fn with_default_namespace(mut self, namespace: &str) -> Self {
        self.default_namespace = Some(namespace.to_string());
        self
    }

    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    pub fn gvk(&self) -> &GroupVersionKind {
        &self.gvk
    }

    pub fn kind(&self) -> &str {
        &self.gvk.kind
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object
            .metadata
            .namespace
            .as_deref()
            .or(self.default_namespace.as_deref())
    }
}
