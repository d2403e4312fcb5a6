//! Error types for the Kubewarden addon provider

use crate::selector::SelectorError;
use std::fmt;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Steps of the per-cluster addon installation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    EnsureNamespace,
    InstallCrds,
    InstallController,
    InstallDefaults,
    MarkInstalled,
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallStep::EnsureNamespace => "ensure namespace",
            InstallStep::InstallCrds => "install CRDs",
            InstallStep::InstallController => "install controller",
            InstallStep::InstallDefaults => "install defaults",
            InstallStep::MarkInstalled => "mark installed",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during operator operations
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A client for the workload cluster could not be built
    #[error("Remote client for cluster {cluster}: {message}")]
    RemoteClient { cluster: String, message: String },

    /// A remote call did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The cluster selector could not be evaluated
    #[error("Invalid cluster selector: {0}")]
    Selector(#[from] SelectorError),

    /// The resource spec failed validation
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// An addon installation step failed
    #[error("Failed to {step}: {source}")]
    InstallStep {
        step: InstallStep,
        #[source]
        source: Box<OperatorError>,
    },

    /// The API server refused the request
    #[error("Rejected by API server: {0}")]
    Rejected(String),

    /// Optimistic concurrency conflict on update
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The resource status could not be written back
    #[error("Status patch failed: {0}")]
    StatusPatch(String),

    /// A manifest could not be decoded
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Helm chart rendering failed
    #[error("Chart render error: {0}")]
    ChartRender(String),

    /// Downloading the CRD bundle failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl OperatorError {
    /// Wrap an error as the failure of an installation step.
    pub fn install_step(step: InstallStep, err: OperatorError) -> Self {
        OperatorError::InstallStep {
            step,
            source: Box::new(err),
        }
    }

    pub fn remote_client(cluster: impl Into<String>, message: impl fmt::Display) -> Self {
        OperatorError::RemoteClient {
            cluster: cluster.into(),
            message: message.to_string(),
        }
    }

    /// Transient errors are retried after a delay without marking the resource failed.
    pub fn is_transient(&self) -> bool {
        match self {
            OperatorError::KubeApi(_)
            | OperatorError::RemoteClient { .. }
            | OperatorError::Timeout(_)
            | OperatorError::Conflict(_) => true,
            OperatorError::InstallStep { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Errors that will not go away until the resource spec changes.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            OperatorError::Selector(_) | OperatorError::InvalidSpec(_)
        )
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => OperatorError::NotFound(ae.message),
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message),
            // 429 is throttling and stays retryable.
            kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 429 => {
                OperatorError::Rejected(ae.message)
            }
            other => OperatorError::KubeApi(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OperatorError {
    fn from(err: serde_yaml::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}
