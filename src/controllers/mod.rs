//! Controllers for the Kubewarden addon provider
//!
//! Each controller watches its custom resource plus CAPI Clusters and
//! reconciles the resource against every workload cluster its selector
//! matches.

mod addon;
mod mapping;
mod policy;

pub use addon::{AddonController, AddonReconciler};
pub use mapping::{resources_for_cluster, ClusterSelecting};
pub use policy::{PolicyController, PolicyReconciler};

use crate::conditions::CONDITION_READY;
use crate::error::{OperatorError, Result};
use crate::patch::status_patch;
use crate::store::ResourceStore;
use futures::{stream, Future, StreamExt};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const STATUS_PATCH_BACKOFF: Duration = Duration::from_secs(5);
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

/// Requeue delay for a failed reconcile, `None` when only a spec change can help.
pub fn backoff_for(error: &OperatorError) -> Option<Duration> {
    if error.is_permanent() {
        return None;
    }
    let base = match error {
        OperatorError::StatusPatch(_) => STATUS_PATCH_BACKOFF,
        e if e.is_transient() => TRANSIENT_BACKOFF,
        _ => DEFAULT_BACKOFF,
    };
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
    Some(base + Duration::from_millis(jitter_ms))
}

/// Error policy shared by all controllers.
pub(crate) fn error_policy_backoff<K, C>(obj: Arc<K>, error: &OperatorError, _ctx: Arc<C>) -> Action
where
    K: Resource,
{
    match backoff_for(error) {
        Some(delay) => {
            warn!(
                resource = %obj.name_any(),
                "Reconciliation failed: {}, requeueing in {:?}",
                error,
                delay
            );
            Action::requeue(delay)
        }
        None => {
            warn!(resource = %obj.name_any(), "Reconciliation failed: {}, waiting for a change", error);
            Action::await_change()
        }
    }
}

/// Run `work` for every item with at most `limit` in flight, returning results in input order.
pub(crate) async fn fan_out<I, F, Fut>(items: I, limit: usize, work: F) -> Vec<Fut::Output>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future,
{
    stream::iter(items.into_iter().map(work))
        .buffered(limit.max(1))
        .collect()
        .await
}

/// Write `desired` as a merge patch against the live status. Returns whether a patch was sent.
///
/// Only the condition types in `owned`, plus the `Ready` summary, are written.
pub(crate) async fn write_status<K, S>(
    store: &dyn ResourceStore<K>,
    obj: &K,
    desired: &S,
    owned: &[&str],
) -> Result<bool>
where
    K: Resource,
    S: Serialize,
{
    let live = store.live_status(obj).await?;
    let owned: Vec<&str> = owned.iter().copied().chain([CONDITION_READY]).collect();
    let Some(patch) = status_patch(
        live.status.as_ref(),
        live.resource_version.as_deref(),
        desired,
        &owned,
    )?
    else {
        debug!(resource = %obj.name_any(), "Status unchanged");
        return Ok(false);
    };
    store.patch_status(obj, &patch).await.map_err(|e| match e {
        OperatorError::StatusPatch(_) => e,
        other => OperatorError::StatusPatch(other.to_string()),
    })?;
    Ok(true)
}

/// Api limited to one namespace, or cluster-wide when none is given.
pub(crate) fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// "a: x; b: y" for per-cluster messages.
pub(crate) fn join_messages(entries: &[String]) -> String {
    entries.join("; ")
}
