use super::Manifest;
use crate::error::Result;
use crate::remote::{with_timeout, CreateOutcome, RemoteClient};
use std::time::Duration;
use tracing::debug;

/// Counts of one `apply_all` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub existing: usize,
}

/// Create every manifest in order on the workload cluster.
///
/// Objects that already exist are skipped, never merged. The first hard
/// failure stops the run since later objects may depend on earlier ones.
pub async fn apply_all(
    client: &dyn RemoteClient,
    manifests: &[Manifest],
    call_timeout: Duration,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    for manifest in manifests {
        let what = format!("create {} {}", manifest.kind(), manifest.name());
        match with_timeout(call_timeout, &what, client.create(manifest)).await? {
            CreateOutcome::Created => {
                debug!(kind = manifest.kind(), name = %manifest.name(), "Created object");
                summary.created += 1;
            }
            CreateOutcome::AlreadyExists => {
                debug!(kind = manifest.kind(), name = %manifest.name(), "Object already exists");
                summary.existing += 1;
            }
        }
    }
    Ok(summary)
}
