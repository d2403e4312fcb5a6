//! Helm chart rendering
//!
//! Charts are rendered client-side with `helm template` and the output is
//! created object by object on the workload cluster. No Helm release is
//! recorded on the workload cluster.

use crate::crd::{KubewardenAddonSpec, DEFAULT_VERSION};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::io::Write;
use tokio::process::Command;
use tracing::debug;

/// A chart to render and where its objects go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartRef {
    pub repository: String,
    pub name: String,
    /// `None` renders the newest chart version.
    pub version: Option<String>,
    pub namespace: String,
}

impl ChartRef {
    pub fn new(repository: &str, name: &str, version: &str, namespace: &str) -> Self {
        Self {
            repository: repository.to_string(),
            name: name.to_string(),
            version: (version != DEFAULT_VERSION && !version.is_empty())
                .then(|| version.to_string()),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
pub trait ChartRenderer: Send + Sync {
    /// Render the chart with the given values into a multi-document YAML stream.
    async fn render(&self, chart: &ChartRef, values: &Value) -> Result<String>;
}

/// Renders charts by running the helm binary.
pub struct HelmCli {
    binary: String,
}

impl HelmCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ChartRenderer for HelmCli {
    async fn render(&self, chart: &ChartRef, values: &Value) -> Result<String> {
        let mut values_file = tempfile::Builder::new()
            .prefix("values-")
            .suffix(".yaml")
            .tempfile()?;
        values_file.write_all(serde_yaml::to_string(values)?.as_bytes())?;
        values_file.flush()?;

        let mut command = Command::new(&self.binary);
        // A cancelled or timed out reconcile must not leave helm running.
        command
            .kill_on_drop(true)
            .arg("template")
            .arg(&chart.name)
            .arg(&chart.name)
            .arg("--repo")
            .arg(&chart.repository)
            .arg("--namespace")
            .arg(&chart.namespace)
            .arg("--values")
            .arg(values_file.path());
        if let Some(version) = &chart.version {
            command.arg("--version").arg(version);
        }

        debug!(chart = %chart.name, version = ?chart.version, "Rendering chart");
        let output = command.output().await.map_err(|e| {
            OperatorError::ChartRender(format!("failed to run {}: {}", self.binary, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OperatorError::ChartRender(format!(
                "helm template {} failed: {}",
                chart.name,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| OperatorError::ChartRender(format!("non UTF-8 chart output: {}", e)))
    }
}

/// Split an image repository into registry host and path.
///
/// `ghcr.io/kubewarden` becomes (`ghcr.io`, `kubewarden`). A bare host keeps
/// the upstream `kubewarden` path.
fn split_image_repository(repository: &str) -> (&str, &str) {
    match repository.split_once('/') {
        Some((registry, path)) if !path.is_empty() => (registry, path.trim_end_matches('/')),
        Some((registry, _)) => (registry, "kubewarden"),
        None => (repository, "kubewarden"),
    }
}

fn registry_values(registry: &str) -> Value {
    json!({ "cattle": { "systemDefaultRegistry": registry } })
}

/// Values for the kubewarden-controller chart.
pub fn controller_values(spec: &KubewardenAddonSpec) -> Value {
    let (registry, path) = split_image_repository(&spec.image_repository);
    json!({
        "global": registry_values(registry),
        "image": { "repository": format!("{}/kubewarden-controller", path) }
    })
}

/// Values for the kubewarden-defaults chart, including the PolicyServer settings.
pub fn defaults_values(spec: &KubewardenAddonSpec) -> Value {
    let (registry, path) = split_image_repository(&spec.image_repository);
    let config = &spec.policy_server_config;

    let mut policy_server = Map::new();
    policy_server.insert(
        "image".to_string(),
        json!({ "repository": format!("{}/policy-server", path) }),
    );
    if let Some(replicas) = config.replicas {
        policy_server.insert("replicaCount".to_string(), json!(replicas));
    }
    let mut requests = Map::new();
    if let Some(cpu) = &config.resources.cpu {
        requests.insert("cpu".to_string(), json!(cpu));
    }
    if let Some(memory) = &config.resources.memory {
        requests.insert("memory".to_string(), json!(memory));
    }
    if !requests.is_empty() {
        policy_server.insert("resources".to_string(), json!({ "requests": requests }));
    }

    json!({
        "global": registry_values(registry),
        "policyServer": policy_server
    })
}
