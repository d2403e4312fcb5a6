//! Kubewarden installation payload
//!
//! Producers of manifests (chart renderer, CRD bundle) and the create-only
//! applier that pushes them to a workload cluster.

mod apply;
mod chart;
mod crds;
mod manifest;

pub use apply::{apply_all, ApplySummary};
pub use chart::{controller_values, defaults_values, ChartRef, ChartRenderer, HelmCli};
pub use crds::{extract_tar_gz, load_yaml_dir, CrdSource, HttpCrdBundle};
pub use manifest::Manifest;
