//! KubewardenPolicy Controller
//!
//! Deploys one Kubewarden admission policy to every selected workload cluster
//! that has Kubewarden installed, and reports per-cluster activation. Remote
//! policies are removed on a best-effort basis when the resource is deleted.

use super::{
    error_policy_backoff, fan_out, join_messages, resources_for_cluster, scoped_api, write_status,
    ClusterSelecting,
};
use crate::conditions::{
    false_condition, set_condition, set_summary, true_condition, POLICY_DEPLOYED,
    POLICY_FINALIZER, POLICY_SPECS_UP_TO_DATE, REASON_CLUSTER_SELECTION_FAILED,
    REASON_INVALID_SPEC, REASON_NO_MATCHING_CLUSTERS, REASON_POLICY_ACTIVE,
    REASON_POLICY_DEPLOY_FAILED, REASON_POLICY_PENDING, REASON_SPECS_VALID,
};
use crate::config::ProviderConfig;
use crate::crd::{
    Cluster, DeployedPolicyStatus, KubewardenPolicy, KubewardenPolicySpec,
    KubewardenPolicyStatus, PolicySpec, PolicyTarget,
};
use crate::error::{OperatorError, Result};
use crate::remote::{with_timeout, RemoteClient, RemoteClientProvider};
use crate::selector;
use crate::store::{has_finalizer, ClusterStore, ResourceStore};
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const OWNED_CONDITIONS: &[&str] = &[POLICY_SPECS_UP_TO_DATE, POLICY_DEPLOYED];

const MESSAGE_ACTIVE: &str = "Policy successfully deployed and active";
const MESSAGE_PENDING: &str = "Policy deployed but not yet active";

/// Result of deploying the policy to one cluster
#[derive(Debug)]
enum DeployOutcome {
    NotReady,
    Paused,
    AddonMissing,
    Deployed { active: bool },
    Failed(OperatorError),
}

/// Reconciles KubewardenPolicy resources against their collaborators.
pub struct PolicyReconciler {
    clusters: Arc<dyn ClusterStore>,
    policies: Arc<dyn ResourceStore<KubewardenPolicy>>,
    remotes: Arc<dyn RemoteClientProvider>,
    config: Arc<ProviderConfig>,
}

impl PolicyReconciler {
    pub fn new(
        clusters: Arc<dyn ClusterStore>,
        policies: Arc<dyn ResourceStore<KubewardenPolicy>>,
        remotes: Arc<dyn RemoteClientProvider>,
        config: Arc<ProviderConfig>,
    ) -> Self {
        Self {
            clusters,
            policies,
            remotes,
            config,
        }
    }

    /// Reconcile a KubewardenPolicy
    pub async fn reconcile(&self, policy: &KubewardenPolicy) -> Result<Action> {
        let name = policy.name_any();
        let namespace = policy.namespace().unwrap_or_else(|| "default".to_string());

        info!(policy = %name, namespace = %namespace, "Reconciling KubewardenPolicy");

        let spec = policy.spec.defaulted(&name);

        if policy.metadata.deletion_timestamp.is_some() {
            return self.cleanup(policy, &spec, &namespace).await;
        }

        if !has_finalizer(policy, POLICY_FINALIZER) {
            self.policies.add_finalizer(policy, POLICY_FINALIZER).await?;
        }

        let mut status = policy.status.clone().unwrap_or_default();

        if let Err(e) = spec.validate() {
            warn!(policy = %name, "Invalid KubewardenPolicy: {}", e);
            return self
                .fail_spec(policy, status, REASON_INVALID_SPEC, &e.to_string())
                .await;
        }

        let clusters = self.clusters.list(&namespace).await?;
        let selected = match selector::select(&spec.cluster_selector, &clusters) {
            Ok(selected) => selected,
            Err(e) => {
                warn!(policy = %name, "Invalid cluster selector: {}", e);
                status.matching_clusters.clear();
                return self
                    .fail_spec(policy, status, REASON_CLUSTER_SELECTION_FAILED, &e.to_string())
                    .await;
            }
        };

        set_condition(
            &mut status.conditions,
            true_condition(POLICY_SPECS_UP_TO_DATE, REASON_SPECS_VALID, "Policy spec is valid"),
        );
        status.matching_clusters = selected.iter().map(|c| c.reference()).collect();

        if selected.is_empty() {
            info!(policy = %name, "No clusters match the cluster selector");
            status.ready = false;
            status.deployed_policies.clear();
            set_condition(
                &mut status.conditions,
                false_condition(
                    POLICY_DEPLOYED,
                    REASON_NO_MATCHING_CLUSTERS,
                    "No clusters match the cluster selector",
                ),
            );
            set_summary(&mut status.conditions, OWNED_CONDITIONS);
            write_status(self.policies.as_ref(), policy, &status, OWNED_CONDITIONS).await?;
            return Ok(Action::requeue(self.config.not_ready_requeue()));
        }

        let target = spec.target();
        let desired = spec.to_policy_spec();
        let (target, desired) = (&target, &desired);
        let outcomes = fan_out(
            selected.iter().copied(),
            self.config.max_concurrent_clusters,
            |cluster| self.deploy_to_cluster(cluster, target, desired).boxed(),
        )
        .boxed()
        .await;

        let previous = policy
            .status
            .as_ref()
            .map(|s| s.deployed_policies.as_slice())
            .unwrap_or_default();
        let retry = aggregate(&mut status, &selected, &outcomes, target, previous);

        write_status(self.policies.as_ref(), policy, &status, OWNED_CONDITIONS).await?;

        if retry {
            Ok(Action::requeue(self.config.not_ready_requeue()))
        } else {
            Ok(Action::requeue(self.config.policy_requeue()))
        }
    }

    /// Record a spec problem that only a spec change can fix.
    async fn fail_spec(
        &self,
        policy: &KubewardenPolicy,
        mut status: KubewardenPolicyStatus,
        reason: &str,
        message: &str,
    ) -> Result<Action> {
        // Nothing is deployed for a spec that cannot be evaluated; old records would be stale.
        status.ready = false;
        status.deployed_policies.clear();
        set_condition(
            &mut status.conditions,
            false_condition(POLICY_SPECS_UP_TO_DATE, reason, message),
        );
        set_summary(&mut status.conditions, OWNED_CONDITIONS);
        write_status(self.policies.as_ref(), policy, &status, OWNED_CONDITIONS).await?;
        Ok(Action::await_change())
    }

    async fn deploy_to_cluster(
        &self,
        cluster: &Cluster,
        target: &PolicyTarget,
        desired: &PolicySpec,
    ) -> DeployOutcome {
        let name = cluster.name_any();

        if cluster.is_paused() {
            info!(cluster = %name, "Cluster is paused, deferring policy deployment");
            return DeployOutcome::Paused;
        }

        if !cluster.control_plane_ready() {
            info!(cluster = %name, "Cluster control plane not ready, deferring policy deployment");
            return DeployOutcome::NotReady;
        }

        if !cluster.has_annotation(&self.config.installed_annotation) {
            info!(cluster = %name, "Kubewarden not installed on cluster yet, skipping");
            return DeployOutcome::AddonMissing;
        }

        match self.deploy(cluster, target, desired).await {
            Ok(active) => {
                info!(cluster = %name, policy = %target, active, "Policy deployed");
                DeployOutcome::Deployed { active }
            }
            Err(e) => {
                error!(cluster = %name, policy = %target, "Failed to deploy policy: {}", e);
                DeployOutcome::Failed(e)
            }
        }
    }

    /// Create or update the remote policy, then report whether it is active.
    async fn deploy(&self, cluster: &Cluster, target: &PolicyTarget, desired: &PolicySpec) -> Result<bool> {
        let timeout = self.config.remote_call_timeout();
        let remote = with_timeout(
            timeout,
            "get workload cluster client",
            self.remotes.for_cluster(&cluster.reference()),
        )
        .await?;

        self.apply_policy(remote.as_ref(), target, desired).await?;

        let current = with_timeout(
            timeout,
            &format!("get {}", target),
            remote.get_policy(target),
        )
        .await?;
        Ok(current.is_some_and(|p| p.is_active()))
    }

    /// Read-modify-write of the remote policy, retried when another writer wins the race.
    async fn apply_policy(
        &self,
        remote: &dyn RemoteClient,
        target: &PolicyTarget,
        desired: &PolicySpec,
    ) -> Result<()> {
        let timeout = self.config.remote_call_timeout();
        let mut attempts = 0;
        loop {
            let existing =
                with_timeout(timeout, &format!("get {}", target), remote.get_policy(target)).await?;
            let result = match existing {
                None => {
                    debug!(policy = %target, "Creating policy");
                    with_timeout(
                        timeout,
                        &format!("create {}", target),
                        remote.create_policy(target, desired),
                    )
                    .await
                }
                Some(existing) if existing.spec.satisfies(desired) => {
                    debug!(policy = %target, "Policy up to date");
                    return Ok(());
                }
                Some(existing) => {
                    debug!(policy = %target, "Updating policy");
                    let spec = existing.spec.with_managed_fields(desired);
                    with_timeout(
                        timeout,
                        &format!("update {}", target),
                        remote.update_policy(target, &existing, &spec),
                    )
                    .await
                }
            };

            match result {
                Err(OperatorError::Conflict(message)) if attempts < self.config.conflict_retries => {
                    attempts += 1;
                    warn!(policy = %target, attempt = attempts, "Conflict writing policy, retrying: {}", message);
                }
                other => return other,
            }
        }
    }

    /// Best-effort removal of the remote policies, then release the finalizer.
    async fn cleanup(
        &self,
        policy: &KubewardenPolicy,
        spec: &KubewardenPolicySpec,
        namespace: &str,
    ) -> Result<Action> {
        let name = policy.name_any();
        if !has_finalizer(policy, POLICY_FINALIZER) {
            return Ok(Action::await_change());
        }

        if let Err(e) = spec.validate() {
            // An invalid policy was never deployed anywhere.
            debug!(policy = %name, "Skipping remote cleanup of invalid policy: {}", e);
        } else {
            let clusters = self.clusters.list(namespace).await?;
            let recorded = policy.recorded_clusters();
            let targets: Vec<&Cluster> = clusters
                .iter()
                .filter(|c| {
                    let matched = selector::matches(&spec.cluster_selector, c.labels()).unwrap_or_else(|e| {
                        warn!(policy = %name, "Invalid cluster selector during cleanup: {}", e);
                        false
                    });
                    matched || recorded.iter().any(|r| r.name == c.name_any())
                })
                .collect();

            info!(policy = %name, clusters = targets.len(), "Removing policy from workload clusters");
            let target = &spec.target();
            fan_out(targets, self.config.max_concurrent_clusters, |cluster| {
                async move {
                    if let Err(e) = self.delete_from_cluster(cluster, target).await {
                        error!(
                            cluster = %cluster.name_any(),
                            policy = %target,
                            "Failed to remove policy, it may be left behind: {}",
                            e
                        );
                    }
                }
                .boxed()
            })
            .boxed()
            .await;
        }

        self.policies.remove_finalizer(policy, POLICY_FINALIZER).await?;
        info!(policy = %name, "KubewardenPolicy cleanup finished");
        Ok(Action::await_change())
    }

    async fn delete_from_cluster(&self, cluster: &Cluster, target: &PolicyTarget) -> Result<()> {
        let timeout = self.config.remote_call_timeout();
        let remote = with_timeout(
            timeout,
            "get workload cluster client",
            self.remotes.for_cluster(&cluster.reference()),
        )
        .await?;
        let deleted =
            with_timeout(timeout, &format!("delete {}", target), remote.delete_policy(target)).await?;
        if deleted {
            info!(cluster = %cluster.name_any(), policy = %target, "Deleted policy");
        } else {
            debug!(cluster = %cluster.name_any(), policy = %target, "Policy already gone");
        }
        Ok(())
    }
}

/// Fold per-cluster outcomes into the status. Returns whether a prompt retry is needed.
fn aggregate(
    status: &mut KubewardenPolicyStatus,
    selected: &[&Cluster],
    outcomes: &[DeployOutcome],
    target: &PolicyTarget,
    previous: &[DeployedPolicyStatus],
) -> bool {
    let mut records = Vec::new();
    let mut waiting = Vec::new();
    let mut paused = Vec::new();
    let mut pending = Vec::new();
    let mut retrying = Vec::new();
    let mut failures = Vec::new();

    for (cluster, outcome) in selected.iter().zip(outcomes) {
        let name = cluster.name_any();
        match outcome {
            DeployOutcome::NotReady => waiting.push(format!("{}: control plane not ready", name)),
            DeployOutcome::AddonMissing => waiting.push(format!("{}: Kubewarden not installed", name)),
            DeployOutcome::Paused => paused.push(format!("{}: cluster paused", name)),
            DeployOutcome::Deployed { active } => {
                let message = if *active { MESSAGE_ACTIVE } else { MESSAGE_PENDING };
                if !active {
                    pending.push(name.clone());
                }
                records.push(record(cluster, target, *active, message, previous));
            }
            DeployOutcome::Failed(e) => {
                let entry = format!("{}: {}", name, e);
                if e.is_transient() {
                    retrying.push(entry);
                } else {
                    failures.push(entry);
                }
                records.push(record(cluster, target, false, &e.to_string(), previous));
            }
        }
    }

    status.ready = waiting.is_empty()
        && paused.is_empty()
        && pending.is_empty()
        && retrying.is_empty()
        && failures.is_empty();
    status.deployed_policies = records;

    let deployed = if status.ready {
        true_condition(
            POLICY_DEPLOYED,
            REASON_POLICY_ACTIVE,
            &format!("Policy active on {} cluster(s)", selected.len()),
        )
    } else if !failures.is_empty() {
        false_condition(POLICY_DEPLOYED, REASON_POLICY_DEPLOY_FAILED, &join_messages(&failures))
    } else {
        // Transient errors are retried without reporting the deployment as failed.
        let mut messages = [retrying.clone(), waiting.clone(), paused].concat();
        if !pending.is_empty() {
            messages.push(format!("not yet active: {}", pending.join(", ")));
        }
        false_condition(POLICY_DEPLOYED, REASON_POLICY_PENDING, &join_messages(&messages))
    };
    set_condition(&mut status.conditions, deployed);
    set_summary(&mut status.conditions, OWNED_CONDITIONS);

    !waiting.is_empty() || !retrying.is_empty() || !failures.is_empty()
}

/// Deployment record for one cluster, keeping the previous transition time while `active` holds.
fn record(
    cluster: &Cluster,
    target: &PolicyTarget,
    active: bool,
    message: &str,
    previous: &[DeployedPolicyStatus],
) -> DeployedPolicyStatus {
    let cluster_name = cluster.name_any();
    let cluster_namespace = cluster.namespace().unwrap_or_default();
    let last_transition_time = previous
        .iter()
        .find(|p| {
            p.cluster_name == cluster_name
                && p.cluster_namespace == cluster_namespace
                && p.policy_name == target.name()
                && p.active == active
        })
        .and_then(|p| p.last_transition_time.clone())
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    DeployedPolicyStatus {
        cluster_name,
        cluster_namespace,
        policy_name: target.name().to_string(),
        policy_type: target.policy_type(),
        active,
        last_transition_time: Some(last_transition_time),
        message: Some(message.to_string()),
    }
}

/// Runs the KubewardenPolicy controller.
pub struct PolicyController {
    client: Client,
    namespace: Option<String>,
    reconciler: PolicyReconciler,
}

impl PolicyController {
    pub fn new(client: Client, namespace: Option<String>, reconciler: PolicyReconciler) -> Self {
        Self {
            client,
            namespace,
            reconciler,
        }
    }

    /// Run the policy controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let policies: Api<KubewardenPolicy> = scoped_api(self.client.clone(), self.namespace.as_deref());
        let clusters: Api<Cluster> = scoped_api(self.client.clone(), self.namespace.as_deref());

        info!("Starting KubewardenPolicy controller");

        let controller = Controller::new(policies, Config::default());
        let store = controller.store();
        controller
            .watches(clusters, Config::default(), move |cluster| {
                resources_for_cluster(&cluster, &store.state())
            })
            .shutdown_on_signal()
            .run(
                |policy, ctx| async move { ctx.reconciler.reconcile(&policy).await },
                |policy, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(policy, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled policy: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }
}
