//! Kubewarden CRD bundle
//!
//! Every kubewarden-controller release publishes its CRDs as a gzipped tar
//! archive of YAML files. The archive is downloaded into a temporary file,
//! unpacked into a temporary directory and decoded in file-name order.

use super::Manifest;
use crate::config::ProviderConfig;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait CrdSource: Send + Sync {
    /// CRD manifests for a Kubewarden version.
    async fn crds(&self, version: &str) -> Result<Vec<Manifest>>;
}

/// Downloads CRD bundles from the kubewarden-controller GitHub releases.
pub struct HttpCrdBundle {
    http: reqwest::Client,
    config: ProviderConfig,
}

impl HttpCrdBundle {
    pub fn new(config: ProviderConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OperatorError::Configuration(format!("http client: {}", e)))?;
        Ok(Self { http, config })
    }

    async fn download(&self, url: &str) -> Result<tempfile::NamedTempFile> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| OperatorError::Fetch(format!("GET {}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(OperatorError::Fetch(format!(
                "GET {}: HTTP {}",
                url,
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| OperatorError::Fetch(format!("GET {}: {}", url, e)))?;

        let mut archive = tempfile::Builder::new()
            .prefix("kubewarden-crds-")
            .suffix(".tar.gz")
            .tempfile()?;
        archive.write_all(&body)?;
        archive.flush()?;
        debug!(url, bytes = body.len(), "Downloaded CRD bundle");
        Ok(archive)
    }
}

#[async_trait]
impl CrdSource for HttpCrdBundle {
    async fn crds(&self, version: &str) -> Result<Vec<Manifest>> {
        let url = self.config.crd_bundle_url(version);
        let archive = self.download(&url).await?;

        let manifests = tokio::task::spawn_blocking(move || -> Result<Vec<Manifest>> {
            let dir = tempfile::tempdir()?;
            extract_tar_gz(archive.path(), dir.path())?;
            load_yaml_dir(dir.path())
        })
        .await
        .map_err(|e| OperatorError::Fetch(format!("CRD extraction task failed: {}", e)))??;

        info!(version, count = manifests.len(), "Loaded Kubewarden CRDs");
        Ok(manifests)
    }
}

/// Unpack a gzipped tar archive into `dest`.
pub fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.unpack(dest)
        .map_err(|e| OperatorError::Fetch(format!("failed to extract {}: {}", archive.display(), e)))
}

/// Decode every `*.yaml`/`*.yml` file below `dir`, sorted by path.
pub fn load_yaml_dir(dir: &Path) -> Result<Vec<Manifest>> {
    let mut files = Vec::new();
    collect_yaml_files(dir, &mut files)?;
    files.sort();

    let mut manifests = Vec::new();
    for file in files {
        let contents = std::fs::read_to_string(&file)?;
        let parsed = Manifest::parse_stream(&contents).map_err(|e| {
            OperatorError::Manifest(format!("{}: {}", file.display(), e))
        })?;
        manifests.extend(parsed);
    }
    Ok(manifests)
}

fn collect_yaml_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_yaml_files(&path, files)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            files.push(path);
        }
    }
    Ok(())
}
