//! KubewardenAddon Controller
//!
//! Installs Kubewarden on every workload cluster selected by a
//! KubewardenAddon: namespace, CRDs, the kubewarden-controller chart and the
//! kubewarden-defaults chart, in that order. A successfully installed cluster
//! is annotated so later passes skip it.

use super::{error_policy_backoff, fan_out, join_messages, resources_for_cluster, scoped_api, write_status};
use crate::conditions::{
    false_condition, set_condition, set_summary, true_condition, ADDON_READY,
    ADDON_SPECS_UP_TO_DATE, REASON_CLUSTER_SELECTION_FAILED, REASON_CREATION_FAILED,
    REASON_CLUSTER_PAUSED, REASON_INSTALLED, REASON_NO_MATCHING_CLUSTERS, REASON_REINSTALLING,
    REASON_SPECS_UPDATING, REASON_WAITING_FOR_CONTROL_PLANE,
};
use crate::config::ProviderConfig;
use crate::crd::{Cluster, KubewardenAddon, KubewardenAddonSpec, KubewardenAddonStatus};
use crate::error::{InstallStep, OperatorError, Result};
use crate::install::{
    apply_all, controller_values, defaults_values, ApplySummary, ChartRef, ChartRenderer,
    CrdSource, Manifest,
};
use crate::remote::{with_timeout, RemoteClient, RemoteClientProvider};
use crate::selector;
use crate::store::{ClusterStore, ResourceStore};
use futures::{FutureExt, StreamExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const OWNED_CONDITIONS: &[&str] = &[ADDON_SPECS_UP_TO_DATE, ADDON_READY];

/// Result of the install sequence on one cluster
#[derive(Debug)]
enum InstallOutcome {
    Installed,
    AlreadyInstalled,
    NotReady,
    Paused,
    Failed(OperatorError),
}

/// Reconciles KubewardenAddon resources against their collaborators.
pub struct AddonReconciler {
    clusters: Arc<dyn ClusterStore>,
    addons: Arc<dyn ResourceStore<KubewardenAddon>>,
    remotes: Arc<dyn RemoteClientProvider>,
    charts: Arc<dyn ChartRenderer>,
    crds: Arc<dyn CrdSource>,
    config: Arc<ProviderConfig>,
}

impl AddonReconciler {
    pub fn new(
        clusters: Arc<dyn ClusterStore>,
        addons: Arc<dyn ResourceStore<KubewardenAddon>>,
        remotes: Arc<dyn RemoteClientProvider>,
        charts: Arc<dyn ChartRenderer>,
        crds: Arc<dyn CrdSource>,
        config: Arc<ProviderConfig>,
    ) -> Self {
        Self {
            clusters,
            addons,
            remotes,
            charts,
            crds,
            config,
        }
    }

    /// Reconcile a KubewardenAddon
    pub async fn reconcile(&self, addon: &KubewardenAddon) -> Result<Action> {
        let name = addon.name_any();
        let namespace = addon.namespace().unwrap_or_else(|| "default".to_string());

        info!(addon = %name, namespace = %namespace, "Reconciling KubewardenAddon");

        // Kubewarden is left installed on workload clusters when the addon goes away.
        if addon.metadata.deletion_timestamp.is_some() {
            debug!(addon = %name, "KubewardenAddon is being deleted, nothing to clean up");
            return Ok(Action::await_change());
        }

        let spec = addon.spec.defaulted();
        let mut status = addon.status.clone().unwrap_or_default();

        let clusters = self.clusters.list(&namespace).await?;
        let selected = match selector::select(&spec.cluster_selector, &clusters) {
            Ok(selected) => selected,
            Err(e) => {
                warn!(addon = %name, "Invalid cluster selector: {}", e);
                status.ready = false;
                status.matching_clusters.clear();
                set_condition(
                    &mut status.conditions,
                    false_condition(
                        ADDON_SPECS_UP_TO_DATE,
                        REASON_CLUSTER_SELECTION_FAILED,
                        &e.to_string(),
                    ),
                );
                set_summary(&mut status.conditions, OWNED_CONDITIONS);
                write_status(self.addons.as_ref(), addon, &status, OWNED_CONDITIONS).await?;
                return Ok(Action::await_change());
            }
        };

        let spec = &spec;
        let outcomes = fan_out(
            selected.iter().copied(),
            self.config.max_concurrent_clusters,
            |cluster| self.install_on_cluster(cluster, spec).boxed(),
        )
        .boxed()
        .await;

        status.matching_clusters = selected.iter().map(|c| c.reference()).collect();
        let retry = aggregate(&mut status, &selected, &outcomes);

        write_status(self.addons.as_ref(), addon, &status, OWNED_CONDITIONS).await?;

        if retry {
            Ok(Action::requeue(self.config.not_ready_requeue()))
        } else {
            Ok(Action::await_change())
        }
    }

    async fn install_on_cluster(&self, cluster: &Cluster, spec: &KubewardenAddonSpec) -> InstallOutcome {
        let name = cluster.name_any();

        if cluster.is_paused() {
            info!(cluster = %name, "Cluster is paused, deferring installation");
            return InstallOutcome::Paused;
        }

        if !cluster.control_plane_ready() {
            info!(cluster = %name, "Cluster control plane not ready, deferring installation");
            return InstallOutcome::NotReady;
        }

        if cluster.has_annotation(&self.config.installed_annotation) {
            info!(cluster = %name, "Kubewarden already installed on cluster, skipping");
            return InstallOutcome::AlreadyInstalled;
        }

        match self.install(cluster, spec).await {
            Ok(()) => InstallOutcome::Installed,
            Err(e) => {
                error!(cluster = %name, "Failed to install Kubewarden: {}", e);
                InstallOutcome::Failed(e)
            }
        }
    }

    /// Install sequence for one cluster. Every step tolerates objects that already exist.
    async fn install(&self, cluster: &Cluster, spec: &KubewardenAddonSpec) -> Result<()> {
        let name = cluster.name_any();
        let timeout = self.config.remote_call_timeout();
        let namespace = &self.config.kubewarden_namespace;

        let remote = with_timeout(
            timeout,
            "get workload cluster client",
            self.remotes.for_cluster(&cluster.reference()),
        )
        .await?;

        info!(cluster = %name, "Creating namespace for Kubewarden");
        let ns = Manifest::namespace_object(namespace)
            .map_err(|e| OperatorError::install_step(InstallStep::EnsureNamespace, e))?;
        apply_all(remote.as_ref(), &[ns], timeout)
            .await
            .map_err(|e| OperatorError::install_step(InstallStep::EnsureNamespace, e))?;

        info!(cluster = %name, version = %spec.version, "Applying Kubewarden CRDs");
        let crds = with_timeout(timeout, "fetch CRD bundle", self.crds.crds(&spec.version))
            .await
            .map_err(|e| OperatorError::install_step(InstallStep::InstallCrds, e))?;
        apply_all(remote.as_ref(), &crds, timeout)
            .await
            .map_err(|e| OperatorError::install_step(InstallStep::InstallCrds, e))?;

        info!(cluster = %name, "Installing Kubewarden controller");
        let summary = self
            .install_chart(remote.as_ref(), &self.config.controller_chart, spec, controller_values(spec))
            .await
            .map_err(|e| OperatorError::install_step(InstallStep::InstallController, e))?;
        debug!(cluster = %name, created = summary.created, existing = summary.existing, "Controller chart applied");

        info!(cluster = %name, "Installing default PolicyServer");
        let summary = self
            .install_chart(remote.as_ref(), &self.config.defaults_chart, spec, defaults_values(spec))
            .await
            .map_err(|e| OperatorError::install_step(InstallStep::InstallDefaults, e))?;
        debug!(cluster = %name, created = summary.created, existing = summary.existing, "Defaults chart applied");

        info!(
            cluster = %name,
            "Successfully deployed Kubewarden: annotating with {}",
            self.config.installed_annotation
        );
        self.clusters
            .annotate(cluster, &self.config.installed_annotation, "true")
            .await
            .map_err(|e| OperatorError::install_step(InstallStep::MarkInstalled, e))?;

        Ok(())
    }

    async fn install_chart(
        &self,
        remote: &dyn RemoteClient,
        chart_name: &str,
        spec: &KubewardenAddonSpec,
        values: Value,
    ) -> Result<ApplySummary> {
        let namespace = &self.config.kubewarden_namespace;
        let chart = ChartRef::new(&self.config.chart_repository, chart_name, &spec.version, namespace);
        let rendered = with_timeout(
            self.config.remote_call_timeout(),
            &format!("render chart {}", chart_name),
            self.charts.render(&chart, &values),
        )
        .await?;
        let manifests: Vec<Manifest> = Manifest::parse_stream(&rendered)?
            .into_iter()
            .map(|m| m.with_default_namespace(namespace))
            .collect();
        apply_all(remote, &manifests, self.config.remote_call_timeout()).await
    }
}

/// Fold per-cluster outcomes into the status. Returns whether another pass is needed.
///
/// Transient failures (unreachable cluster, timeouts) are retried without
/// marking the addon failed. Paused clusters wait for the unpause event.
fn aggregate(
    status: &mut KubewardenAddonStatus,
    selected: &[&Cluster],
    outcomes: &[InstallOutcome],
) -> bool {
    let mut installed = 0;
    let mut not_ready = Vec::new();
    let mut paused = Vec::new();
    let mut retrying = Vec::new();
    let mut failures = Vec::new();
    for (cluster, outcome) in selected.iter().zip(outcomes) {
        match outcome {
            InstallOutcome::Installed | InstallOutcome::AlreadyInstalled => installed += 1,
            InstallOutcome::NotReady => not_ready.push(cluster.name_any()),
            InstallOutcome::Paused => paused.push(cluster.name_any()),
            InstallOutcome::Failed(e) if e.is_transient() => {
                retrying.push(format!("{}: {}", cluster.name_any(), e))
            }
            InstallOutcome::Failed(e) => failures.push(format!("{}: {}", cluster.name_any(), e)),
        }
    }

    status.ready = !selected.is_empty() && installed == selected.len();

    let mut waiting = Vec::new();
    if !not_ready.is_empty() {
        waiting.push(format!("waiting for control plane: {}", not_ready.join(", ")));
    }
    if !paused.is_empty() {
        waiting.push(format!("paused: {}", paused.join(", ")));
    }

    let (specs, ready) = if selected.is_empty() {
        (
            true_condition(ADDON_SPECS_UP_TO_DATE, REASON_INSTALLED, "No clusters to install"),
            false_condition(
                ADDON_READY,
                REASON_NO_MATCHING_CLUSTERS,
                "No clusters match the cluster selector",
            ),
        )
    } else if status.ready {
        let message = format!("Kubewarden installed on {} cluster(s)", installed);
        (
            true_condition(ADDON_SPECS_UP_TO_DATE, REASON_INSTALLED, &message),
            true_condition(ADDON_READY, REASON_INSTALLED, &message),
        )
    } else if !failures.is_empty() {
        let message = join_messages(&[failures.clone(), retrying.clone(), waiting].concat());
        (
            false_condition(ADDON_SPECS_UP_TO_DATE, REASON_CREATION_FAILED, &message),
            false_condition(ADDON_READY, REASON_CREATION_FAILED, &message),
        )
    } else if !retrying.is_empty() {
        let message = join_messages(&[retrying.clone(), waiting].concat());
        (
            false_condition(ADDON_SPECS_UP_TO_DATE, REASON_REINSTALLING, &message),
            false_condition(ADDON_READY, REASON_REINSTALLING, &message),
        )
    } else {
        let reason = if not_ready.is_empty() {
            REASON_CLUSTER_PAUSED
        } else {
            REASON_WAITING_FOR_CONTROL_PLANE
        };
        let message = join_messages(&waiting);
        (
            false_condition(ADDON_SPECS_UP_TO_DATE, REASON_SPECS_UPDATING, &message),
            false_condition(ADDON_READY, reason, &message),
        )
    };
    set_condition(&mut status.conditions, specs);
    set_condition(&mut status.conditions, ready);
    set_summary(&mut status.conditions, OWNED_CONDITIONS);

    !not_ready.is_empty() || !retrying.is_empty() || !failures.is_empty()
}

/// Runs the KubewardenAddon controller.
pub struct AddonController {
    client: Client,
    namespace: Option<String>,
    reconciler: AddonReconciler,
}

impl AddonController {
    pub fn new(client: Client, namespace: Option<String>, reconciler: AddonReconciler) -> Self {
        Self {
            client,
            namespace,
            reconciler,
        }
    }

    /// Run the addon controller
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addons: Api<KubewardenAddon> = scoped_api(self.client.clone(), self.namespace.as_deref());
        let clusters: Api<Cluster> = scoped_api(self.client.clone(), self.namespace.as_deref());

        info!("Starting KubewardenAddon controller");

        let controller = Controller::new(addons, Config::default());
        let store = controller.store();
        controller
            .watches(clusters, Config::default(), move |cluster| {
                resources_for_cluster(&cluster, &store.state())
            })
            .shutdown_on_signal()
            .run(
                |addon, ctx| async move { ctx.reconciler.reconcile(&addon).await },
                |addon, error, ctx| {
                    error!("Reconciliation error: {:?}", error);
                    error_policy_backoff(addon, error, ctx)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled addon: {}", obj.name);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{is_true, CONDITION_READY};
    use crate::testing::{addon, cluster, AddonHarness, INSTALLED_ANNOTATION};

    #[tokio::test]
    async fn test_installs_on_matching_ready_cluster() {
        let h = AddonHarness::new(vec![
            cluster("workload", &[("testing", "true")], true),
            cluster("other", &[("testing", "false")], true),
        ]);
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::await_change());

        let installed = h.clusters.get("workload").unwrap();
        assert!(installed.has_annotation(INSTALLED_ANNOTATION));
        assert!(!h.clusters.get("other").unwrap().has_annotation(INSTALLED_ANNOTATION));

        let remote = h.remotes.client("workload");
        assert!(remote.has_object("Namespace", None, "kubewarden"));
        assert!(remote.has_object("CustomResourceDefinition", None, "policyservers.policies.kubewarden.io"));
        assert!(remote.has_object("Deployment", Some("kubewarden"), "kubewarden-controller"));
        assert!(remote.has_object("PolicyServer", Some("kubewarden"), "default"));
        assert!(h.remotes.try_client("other").is_none());

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        assert!(status.ready);
        assert_eq!(status.matching_clusters.len(), 1);
        assert_eq!(status.matching_clusters[0].name, "workload");
        assert!(is_true(&status.conditions, ADDON_READY));
        assert!(is_true(&status.conditions, CONDITION_READY));
    }

    #[tokio::test]
    async fn test_second_pass_short_circuits_on_marker() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        let a = addon("kubewarden", &[("testing", "true")]);

        h.reconciler.reconcile(&a).await.unwrap();
        let creates_after_first = h.remotes.client("workload").create_calls();
        let renders_after_first = h.charts.render_count();

        let a = h.addons.with_last_status(a);
        h.reconciler.reconcile(&a).await.unwrap();

        assert_eq!(h.remotes.client("workload").create_calls(), creates_after_first);
        assert_eq!(h.charts.render_count(), renders_after_first);
        assert_eq!(h.clusters.annotate_calls(), 1);
        // Nothing changed, so the second pass does not patch the status.
        assert_eq!(h.addons.status_patch_count(), 1);
    }

    #[tokio::test]
    async fn test_reinstall_without_marker_is_idempotent() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        let a = addon("kubewarden", &[("testing", "true")]);
        h.reconciler.reconcile(&a).await.unwrap();
        let objects = h.remotes.client("workload").object_count();

        // Marker lost: the whole sequence runs again against existing objects.
        h.clusters.remove_annotation("workload", INSTALLED_ANNOTATION);
        h.reconciler.reconcile(&a).await.unwrap();

        assert_eq!(h.remotes.client("workload").object_count(), objects);
        assert!(h.clusters.get("workload").unwrap().has_annotation(INSTALLED_ANNOTATION));
        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        assert!(status.ready);
    }

    #[tokio::test]
    async fn test_not_ready_cluster_requeues() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], false)]);
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(60)));
        assert!(h.remotes.try_client("workload").is_none());

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        assert!(!status.ready);
        assert_eq!(status.matching_clusters.len(), 1);
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_WAITING_FOR_CONTROL_PLANE));
    }

    #[tokio::test]
    async fn test_failure_on_one_cluster_does_not_stop_others() {
        let h = AddonHarness::new(vec![
            cluster("unreachable", &[("testing", "true")], true),
            cluster("healthy", &[("testing", "true")], true),
        ]);
        h.remotes.make_unreachable("unreachable");
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(60)));

        assert!(h.clusters.get("healthy").unwrap().has_annotation(INSTALLED_ANNOTATION));
        assert!(!h.clusters.get("unreachable").unwrap().has_annotation(INSTALLED_ANNOTATION));

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        assert!(!status.ready);
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_REINSTALLING));
        assert!(ready.message.as_deref().unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_rejected_install_marks_creation_failed() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        h.remotes.client("workload").fail_creates_of_kind("Namespace");
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(60)));

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_CREATION_FAILED));
        assert!(ready.message.as_deref().unwrap().contains("ensure namespace"));
        assert_eq!(h.charts.render_count(), 0);
    }

    #[tokio::test]
    async fn test_paused_cluster_is_skipped_until_resumed() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        h.clusters.pause("workload");
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(h.remotes.try_client("workload").is_none());

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        assert!(!status.ready);
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_CLUSTER_PAUSED));
    }

    #[tokio::test]
    async fn test_conditions_of_other_controllers_survive() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        // Written by another controller after our copy of the addon was read.
        h.addons.seed_status(&KubewardenAddonStatus {
            conditions: vec![crate::crd::Condition {
                r#type: "ExternalCheck".to_string(),
                status: "True".to_string(),
                last_transition_time: None,
                reason: Some("Checked".to_string()),
                message: None,
            }],
            ..Default::default()
        });
        let a = addon("kubewarden", &[("testing", "true")]);
        assert!(a.status.is_none());

        h.reconciler.reconcile(&a).await.unwrap();

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        let types: Vec<&str> = status.conditions.iter().map(|c| c.r#type.as_str()).collect();
        assert!(types.contains(&"ExternalCheck"));
        assert!(types.contains(&ADDON_READY));
        assert!(types.contains(&CONDITION_READY));
        assert!(status.ready);
    }

    #[tokio::test]
    async fn test_reconcile_runs_on_a_spawned_task() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        let reconciler = Arc::new(h.reconciler);
        let a = Arc::new(addon("kubewarden", &[("testing", "true")]));

        // Same shape as the reconcile closure handed to the controller runtime.
        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.reconcile(&a).await })
        };
        let action = task.await.unwrap().unwrap();
        assert_eq!(action, Action::await_change());
        assert!(h.clusters.get("workload").unwrap().has_annotation(INSTALLED_ANNOTATION));
    }

    #[tokio::test]
    async fn test_failed_step_is_reported_and_marker_not_set() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        h.charts.fail_chart("kubewarden-defaults");
        let a = addon("kubewarden", &[("testing", "true")]);

        h.reconciler.reconcile(&a).await.unwrap();

        assert!(!h.clusters.get("workload").unwrap().has_annotation(INSTALLED_ANNOTATION));
        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert!(ready.message.as_deref().unwrap().contains("install defaults"));
        // Controller chart objects created before the failure stay in place.
        assert!(h
            .remotes
            .client("workload")
            .has_object("Deployment", Some("kubewarden"), "kubewarden-controller"));
    }

    #[tokio::test]
    async fn test_invalid_selector_sets_condition_and_waits() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        let mut a = addon("kubewarden", &[]);
        a.spec.cluster_selector.match_expressions = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement {
                key: "testing".to_string(),
                operator: "In".to_string(),
                values: Some(vec![]),
            },
        ]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        let specs = status
            .conditions
            .iter()
            .find(|c| c.r#type == ADDON_SPECS_UP_TO_DATE)
            .unwrap();
        assert_eq!(specs.reason.as_deref(), Some(REASON_CLUSTER_SELECTION_FAILED));
        assert!(!h.clusters.get("workload").unwrap().has_annotation(INSTALLED_ANNOTATION));
    }

    #[tokio::test]
    async fn test_no_matching_clusters() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "false")], true)]);
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        assert!(!status.ready);
        assert!(status.matching_clusters.is_empty());
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_NO_MATCHING_CLUSTERS));
    }

    #[tokio::test]
    async fn test_status_patch_failure_is_returned() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        h.addons.fail_status_patches();
        let a = addon("kubewarden", &[("testing", "true")]);

        let err = h.reconciler.reconcile(&a).await.unwrap_err();
        assert!(matches!(err, OperatorError::StatusPatch(_)));
        // The install itself went through.
        assert!(h.clusters.get("workload").unwrap().has_annotation(INSTALLED_ANNOTATION));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_cluster_times_out() {
        let h = AddonHarness::new(vec![cluster("slow", &[("testing", "true")], true)]);
        h.remotes.make_hanging("slow");
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(60)));

        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_REINSTALLING));
        assert!(ready.message.as_deref().unwrap().contains("Timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_chart_render_times_out() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        h.charts.hang_chart("kubewarden-controller");
        let a = addon("kubewarden", &[("testing", "true")]);

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(60)));

        assert!(!h.clusters.get("workload").unwrap().has_annotation(INSTALLED_ANNOTATION));
        let status = h.addons.last_status::<KubewardenAddonStatus>().unwrap();
        let ready = status.conditions.iter().find(|c| c.r#type == ADDON_READY).unwrap();
        assert_eq!(ready.reason.as_deref(), Some(REASON_REINSTALLING));
        let message = ready.message.as_deref().unwrap();
        assert!(message.contains("install controller"));
        assert!(message.contains("render chart kubewarden-controller"));
    }

    #[tokio::test]
    async fn test_deleting_addon_is_left_alone() {
        let h = AddonHarness::new(vec![cluster("workload", &[("testing", "true")], true)]);
        let mut a = addon("kubewarden", &[("testing", "true")]);
        a.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));

        let action = h.reconciler.reconcile(&a).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(h.addons.status_patch_count(), 0);
        assert!(h.remotes.try_client("workload").is_none());
    }
}
