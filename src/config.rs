//! Provider configuration
//!
//! Every value the reconcilers would otherwise hard-code lives here. The
//! built-in defaults match the upstream Kubewarden release layout; a YAML
//! file passed with `--config` may override any subset of fields.

use crate::error::{OperatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Immutable configuration handed to the reconcilers at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Namespace Kubewarden is installed into on workload clusters.
    pub kubewarden_namespace: String,

    /// Helm repository serving the Kubewarden charts.
    pub chart_repository: String,

    pub controller_chart: String,
    pub defaults_chart: String,

    /// CRD bundle URL; `{version}` is replaced by the addon version.
    pub crd_release_url: String,

    /// CRD bundle URL used when the addon asks for the latest release.
    pub crd_latest_url: String,

    /// Path or name of the helm binary.
    pub helm_binary: String,

    /// Annotation marking a Cluster as having Kubewarden installed.
    pub installed_annotation: String,

    /// Delay before rechecking clusters that are not ready yet (seconds).
    pub not_ready_requeue_secs: u64,

    /// Delay before rechecking policy activation (seconds).
    pub policy_requeue_secs: u64,

    /// Upper bound for every call against a workload cluster (seconds).
    pub remote_call_timeout_secs: u64,

    /// Clusters processed concurrently within one reconcile pass.
    pub max_concurrent_clusters: usize,

    /// Update retries when a remote policy write conflicts.
    pub conflict_retries: u32,

    /// Field manager used for patches.
    pub field_manager: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kubewarden_namespace: "kubewarden".to_string(),
            chart_repository: "https://charts.kubewarden.io".to_string(),
            controller_chart: "kubewarden-controller".to_string(),
            defaults_chart: "kubewarden-defaults".to_string(),
            crd_release_url:
                "https://github.com/kubewarden/kubewarden-controller/releases/download/{version}/CRDS.tar.gz"
                    .to_string(),
            crd_latest_url:
                "https://github.com/kubewarden/kubewarden-controller/releases/latest/download/CRDS.tar.gz"
                    .to_string(),
            helm_binary: "helm".to_string(),
            installed_annotation: "addon.cluster.x-k8s.io/kubewarden-installed".to_string(),
            not_ready_requeue_secs: 60,
            policy_requeue_secs: 300,
            remote_call_timeout_secs: 30,
            max_concurrent_clusters: 4,
            conflict_retries: 3,
            field_manager: "kubewarden-addon-provider".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Load overrides from a YAML file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: ProviderConfig = serde_yaml::from_str(contents)
            .map_err(|e| OperatorError::Configuration(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kubewarden_namespace.is_empty() {
            return Err(OperatorError::Configuration(
                "kubewardenNamespace must not be empty".to_string(),
            ));
        }
        if self.installed_annotation.is_empty() {
            return Err(OperatorError::Configuration(
                "installedAnnotation must not be empty".to_string(),
            ));
        }
        if self.max_concurrent_clusters == 0 {
            return Err(OperatorError::Configuration(
                "maxConcurrentClusters must be at least 1".to_string(),
            ));
        }
        if self.remote_call_timeout_secs == 0 {
            return Err(OperatorError::Configuration(
                "remoteCallTimeoutSecs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// URL of the CRD bundle for an addon version.
    pub fn crd_bundle_url(&self, version: &str) -> String {
        if version == crate::crd::DEFAULT_VERSION {
            self.crd_latest_url.clone()
        } else {
            self.crd_release_url.replace("{version}", version)
        }
    }

    pub fn not_ready_requeue(&self) -> Duration {
        Duration::from_secs(self.not_ready_requeue_secs)
    }

    pub fn policy_requeue(&self) -> Duration {
        Duration::from_secs(self.policy_requeue_secs)
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }
}
