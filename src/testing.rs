//! In-memory collaborators and fixtures for unit tests

use crate::config::ProviderConfig;
use crate::controllers::{AddonReconciler, PolicyReconciler};
use crate::crd::{
    Cluster, ClusterReference, ClusterSpec, ClusterStatus, KubewardenAddon, KubewardenAddonSpec,
    KubewardenPolicy, KubewardenPolicySpec, PolicyRule, PolicySpec, PolicyStatus, PolicyTarget,
    PolicyType,
};
use crate::error::{OperatorError, Result};
use crate::install::{ChartRef, ChartRenderer, CrdSource, Manifest};
use crate::remote::{CreateOutcome, RemoteClient, RemoteClientProvider, RemotePolicy};
use crate::store::{annotation_patch, ClusterStore, LiveStatus, ResourceStore};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

pub(crate) const INSTALLED_ANNOTATION: &str = "addon.cluster.x-k8s.io/kubewarden-installed";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn selector(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector {
        match_labels: (!pairs.is_empty()).then(|| labels(pairs)),
        match_expressions: None,
    }
}

/// A Cluster in namespace "default".
pub(crate) fn cluster(name: &str, label_pairs: &[(&str, &str)], ready: bool) -> Cluster {
    let mut c = Cluster::new(name, ClusterSpec::default());
    c.metadata.namespace = Some("default".to_string());
    c.metadata.labels = Some(labels(label_pairs));
    c.status = Some(ClusterStatus {
        control_plane_ready: ready,
        ..Default::default()
    });
    c
}

/// A Cluster already carrying the installed marker.
pub(crate) fn installed_cluster(name: &str, label_pairs: &[(&str, &str)], ready: bool) -> Cluster {
    let mut c = cluster(name, label_pairs, ready);
    c.annotations_mut()
        .insert(INSTALLED_ANNOTATION.to_string(), "true".to_string());
    c
}

/// A KubewardenAddon in namespace "default" selecting `label_pairs`.
pub(crate) fn addon(name: &str, label_pairs: &[(&str, &str)]) -> KubewardenAddon {
    let mut a = KubewardenAddon::new(
        name,
        KubewardenAddonSpec {
            cluster_selector: selector(label_pairs),
            version: String::new(),
            image_repository: String::new(),
            policy_server_config: Default::default(),
        },
    );
    a.metadata.namespace = Some("default".to_string());
    a
}

/// A valid cluster-scoped KubewardenPolicy in namespace "default" selecting `label_pairs`.
pub(crate) fn policy(name: &str, label_pairs: &[(&str, &str)]) -> KubewardenPolicy {
    let mut p = KubewardenPolicy::new(
        name,
        KubewardenPolicySpec {
            cluster_selector: selector(label_pairs),
            policy_type: PolicyType::ClusterAdmissionPolicy,
            policy_name: String::new(),
            target_namespace: String::new(),
            policy_server: String::new(),
            module: "registry://example/policy:v1".to_string(),
            rules: vec![PolicyRule {
                api_groups: vec![String::new()],
                api_versions: vec!["v1".to_string()],
                resources: vec!["pods".to_string()],
                operations: vec!["CREATE".to_string()],
                scope: String::new(),
            }],
            mutating: false,
            settings: None,
            failure_policy: None,
            match_conditions: Vec::new(),
        },
    );
    p.metadata.namespace = Some("default".to_string());
    p
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(map) = target {
        for (key, value) in patch {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Cluster store backed by a vector; annotations are merge-patched onto the stored copy.
pub(crate) struct FakeClusterStore {
    clusters: Mutex<Vec<Cluster>>,
    annotate_calls: Mutex<usize>,
}

impl FakeClusterStore {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self {
            clusters: Mutex::new(clusters),
            annotate_calls: Mutex::new(0),
        }
    }

    pub fn get(&self, name: &str) -> Option<Cluster> {
        self.clusters
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.name_any() == name)
            .cloned()
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut Cluster)) {
        let mut clusters = self.clusters.lock().unwrap();
        let c = clusters
            .iter_mut()
            .find(|c| c.name_any() == name)
            .expect("unknown cluster");
        f(c);
    }

    /// Annotation written by some other actor.
    pub fn annotate_externally(&self, name: &str, key: &str, value: &str) {
        self.update(name, |c| {
            c.annotations_mut().insert(key.to_string(), value.to_string());
        });
    }

    pub fn remove_annotation(&self, name: &str, key: &str) {
        self.update(name, |c| {
            c.annotations_mut().remove(key);
        });
    }

    pub fn set_label(&self, name: &str, key: &str, value: &str) {
        self.update(name, |c| {
            c.labels_mut().insert(key.to_string(), value.to_string());
        });
    }

    pub fn pause(&self, name: &str) {
        self.update(name, |c| c.spec.paused = true);
    }

    pub fn annotate_calls(&self) -> usize {
        *self.annotate_calls.lock().unwrap()
    }
}

#[async_trait]
impl ClusterStore for FakeClusterStore {
    async fn list(&self, namespace: &str) -> Result<Vec<Cluster>> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn annotate(&self, cluster: &Cluster, key: &str, value: &str) -> Result<()> {
        *self.annotate_calls.lock().unwrap() += 1;
        let mut clusters = self.clusters.lock().unwrap();
        let current = clusters
            .iter_mut()
            .find(|c| c.name_any() == cluster.name_any())
            .ok_or_else(|| OperatorError::NotFound(cluster.name_any()))?;
        let mut value_json = serde_json::to_value(&*current)?;
        merge_patch(&mut value_json, &annotation_patch(key, value));
        *current = serde_json::from_value(value_json)?;
        Ok(())
    }
}

#[derive(Default)]
struct ResourceState {
    status: Option<Value>,
    resource_version: u64,
    status_patches: usize,
    fail_status: bool,
    finalizers: Vec<String>,
}

/// Resource store for a single object, keeping the merged status and finalizers.
pub(crate) struct FakeResourceStore<K> {
    state: Mutex<ResourceState>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Default for FakeResourceStore<K> {
    fn default() -> Self {
        Self {
            state: Mutex::new(ResourceState::default()),
            _kind: PhantomData,
        }
    }
}

impl<K> FakeResourceStore<K> {
    /// Status already on the object before the reconciler runs, or written by another controller.
    pub fn seed_status<S: Serialize>(&self, status: &S) {
        let mut state = self.state.lock().unwrap();
        state.status = Some(serde_json::to_value(status).unwrap());
        state.resource_version += 1;
    }

    pub fn fail_status_patches(&self) {
        self.state.lock().unwrap().fail_status = true;
    }

    pub fn status_patch_count(&self) -> usize {
        self.state.lock().unwrap().status_patches
    }

    /// Status as it stands after every patch so far.
    pub fn last_status<S: DeserializeOwned>(&self) -> Option<S> {
        let state = self.state.lock().unwrap();
        state
            .status
            .clone()
            .map(|s| serde_json::from_value(s).unwrap())
    }

    /// `obj` with the stored status, as the next watch event would deliver it.
    pub fn with_last_status<T: Serialize + DeserializeOwned>(&self, obj: T) -> T {
        let Some(status) = self.state.lock().unwrap().status.clone() else {
            return obj;
        };
        let mut value = serde_json::to_value(&obj).unwrap();
        value["status"] = status;
        serde_json::from_value(value).unwrap()
    }

    pub fn finalizers(&self) -> Vec<String> {
        self.state.lock().unwrap().finalizers.clone()
    }
}

#[async_trait]
impl<K: Send + Sync> ResourceStore<K> for FakeResourceStore<K> {
    async fn live_status(&self, _obj: &K) -> Result<LiveStatus> {
        let state = self.state.lock().unwrap();
        Ok(LiveStatus {
            resource_version: Some(state.resource_version.to_string()),
            status: state.status.clone(),
        })
    }

    async fn patch_status(&self, _obj: &K, patch: &Value) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let stale = patch["metadata"]["resourceVersion"]
            .as_str()
            .is_some_and(|rv| rv != state.resource_version.to_string());
        if state.fail_status || stale {
            return Err(OperatorError::StatusPatch("the object has been modified".to_string()));
        }
        state.status_patches += 1;
        state.resource_version += 1;
        let status = state.status.get_or_insert(Value::Null);
        merge_patch(status, &patch["status"]);
        Ok(())
    }

    async fn add_finalizer(&self, _obj: &K, finalizer: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.finalizers.iter().any(|f| f == finalizer) {
            state.finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, _obj: &K, finalizer: &str) -> Result<()> {
        self.state.lock().unwrap().finalizers.retain(|f| f != finalizer);
        Ok(())
    }
}

type ObjectKey = (String, Option<String>, String);

#[derive(Default)]
struct RemoteState {
    objects: BTreeMap<ObjectKey, Value>,
    create_calls: usize,
    failing_kinds: HashSet<String>,
    policies: HashMap<PolicyTarget, RemotePolicy>,
    resource_version: u64,
    activate: bool,
    conflicts: usize,
    reject_policies: bool,
    policy_writes: usize,
}

impl RemoteState {
    fn next_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }

    fn policy_status(&self) -> Option<PolicyStatus> {
        let state = if self.activate { "active" } else { "pending" };
        Some(PolicyStatus {
            policy_status: Some(state.to_string()),
            mode: None,
        })
    }

    fn take_conflict(&mut self) -> Result<()> {
        if self.reject_policies {
            return Err(OperatorError::Rejected(
                "admission webhook denied the request: policy module not allowed".to_string(),
            ));
        }
        if self.conflicts > 0 {
            self.conflicts -= 1;
            return Err(OperatorError::Conflict(
                "the object has been modified; please apply your changes to the latest version"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// One workload cluster's API server.
#[derive(Default)]
pub(crate) struct FakeRemoteClient {
    state: Mutex<RemoteState>,
}

impl FakeRemoteClient {
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn create_calls(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn has_object(&self, kind: &str, namespace: Option<&str>, name: &str) -> bool {
        let key = (kind.to_string(), namespace.map(str::to_string), name.to_string());
        self.state.lock().unwrap().objects.contains_key(&key)
    }

    pub fn fail_creates_of_kind(&self, kind: &str) {
        self.state.lock().unwrap().failing_kinds.insert(kind.to_string());
    }

    pub fn policy(&self, target: &PolicyTarget) -> Option<RemotePolicy> {
        self.state.lock().unwrap().policies.get(target).cloned()
    }

    /// A policy written by someone else before the provider runs.
    pub fn insert_policy(&self, target: &PolicyTarget, spec: PolicySpec) {
        self.insert_policy_with_metadata(target, ObjectMeta::default(), spec);
    }

    pub fn insert_policy_with_metadata(&self, target: &PolicyTarget, metadata: ObjectMeta, spec: PolicySpec) {
        let mut state = self.state.lock().unwrap();
        let policy = RemotePolicy {
            metadata: ObjectMeta {
                name: Some(target.name().to_string()),
                resource_version: state.next_version(),
                ..metadata
            },
            spec,
            status: state.policy_status(),
        };
        state.policies.insert(target.clone(), policy);
    }

    /// Refuse every policy write, as an admission webhook would.
    pub fn reject_policy_writes(&self) {
        self.state.lock().unwrap().reject_policies = true;
    }

    /// Mark current and future policies active, as the policy server would.
    pub fn activate_policies(&self) {
        let mut state = self.state.lock().unwrap();
        state.activate = true;
        let status = state.policy_status();
        for policy in state.policies.values_mut() {
            policy.status = status.clone();
        }
    }

    /// Fail the next `n` policy writes with a conflict.
    pub fn inject_conflicts(&self, n: usize) {
        self.state.lock().unwrap().conflicts = n;
    }

    pub fn conflicts_left(&self) -> usize {
        self.state.lock().unwrap().conflicts
    }

    pub fn policy_writes(&self) -> usize {
        self.state.lock().unwrap().policy_writes
    }
}

#[async_trait]
impl RemoteClient for FakeRemoteClient {
    async fn create(&self, manifest: &Manifest) -> Result<CreateOutcome> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        if state.failing_kinds.contains(manifest.kind()) {
            return Err(OperatorError::Rejected(format!(
                "admission webhook denied {} {}",
                manifest.kind(),
                manifest.name()
            )));
        }
        let key = (
            manifest.kind().to_string(),
            manifest.namespace().map(str::to_string),
            manifest.name(),
        );
        if state.objects.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        state.objects.insert(key, serde_json::to_value(manifest.object())?);
        Ok(CreateOutcome::Created)
    }

    async fn get_policy(&self, target: &PolicyTarget) -> Result<Option<RemotePolicy>> {
        Ok(self.policy(target))
    }

    async fn create_policy(&self, target: &PolicyTarget, spec: &PolicySpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.take_conflict()?;
        if state.policies.contains_key(target) {
            return Err(OperatorError::Conflict(format!("{} already exists", target)));
        }
        let policy = RemotePolicy {
            metadata: ObjectMeta {
                name: Some(target.name().to_string()),
                resource_version: state.next_version(),
                ..Default::default()
            },
            spec: spec.clone(),
            status: state.policy_status(),
        };
        state.policies.insert(target.clone(), policy);
        state.policy_writes += 1;
        Ok(())
    }

    async fn update_policy(
        &self,
        target: &PolicyTarget,
        existing: &RemotePolicy,
        spec: &PolicySpec,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.take_conflict()?;
        let version = state.next_version();
        let stored = state
            .policies
            .get_mut(target)
            .ok_or_else(|| OperatorError::NotFound(target.to_string()))?;
        if stored.resource_version() != existing.resource_version() {
            return Err(OperatorError::Conflict(format!("{} changed", target)));
        }
        // Replace semantics: the object becomes exactly what was sent.
        stored.metadata = ObjectMeta {
            resource_version: version,
            ..existing.metadata.clone()
        };
        stored.spec = spec.clone();
        state.policy_writes += 1;
        Ok(())
    }

    async fn delete_policy(&self, target: &PolicyTarget) -> Result<bool> {
        Ok(self.state.lock().unwrap().policies.remove(target).is_some())
    }
}

#[derive(Default)]
struct ProviderState {
    clients: BTreeMap<String, Arc<FakeRemoteClient>>,
    unreachable: HashSet<String>,
    hanging: HashSet<String>,
    activate: bool,
}

/// Hands out one [`FakeRemoteClient`] per cluster name, created on first use.
#[derive(Default)]
pub(crate) struct FakeRemoteProvider {
    state: Mutex<ProviderState>,
}

impl FakeRemoteProvider {
    pub fn client(&self, name: &str) -> Arc<FakeRemoteClient> {
        let mut state = self.state.lock().unwrap();
        let activate = state.activate;
        Arc::clone(state.clients.entry(name.to_string()).or_insert_with(|| {
            let client = FakeRemoteClient::default();
            if activate {
                client.activate_policies();
            }
            Arc::new(client)
        }))
    }

    /// The client for `name` if the provider ever handed one out.
    pub fn try_client(&self, name: &str) -> Option<Arc<FakeRemoteClient>> {
        self.state.lock().unwrap().clients.get(name).cloned()
    }

    pub fn make_unreachable(&self, name: &str) {
        self.state.lock().unwrap().unreachable.insert(name.to_string());
    }

    /// Client acquisition for `name` never completes.
    pub fn make_hanging(&self, name: &str) {
        self.state.lock().unwrap().hanging.insert(name.to_string());
    }

    pub fn activate_policies_everywhere(&self) {
        let clients: Vec<Arc<FakeRemoteClient>> = {
            let mut state = self.state.lock().unwrap();
            state.activate = true;
            state.clients.values().cloned().collect()
        };
        for client in clients {
            client.activate_policies();
        }
    }
}

#[async_trait]
impl RemoteClientProvider for FakeRemoteProvider {
    async fn for_cluster(&self, cluster: &ClusterReference) -> Result<Arc<dyn RemoteClient>> {
        let (hanging, unreachable) = {
            let state = self.state.lock().unwrap();
            (
                state.hanging.contains(&cluster.name),
                state.unreachable.contains(&cluster.name),
            )
        };
        if hanging {
            return std::future::pending().await;
        }
        if unreachable {
            return Err(OperatorError::remote_client(
                cluster.name.clone(),
                "dial tcp 10.0.0.1:6443: connect: connection refused (unreachable)",
            ));
        }
        Ok(self.client(&cluster.name))
    }
}

const CONTROLLER_CHART: &str = r#"---
apiVersion: v1
kind: ServiceAccount
metadata:
  name: kubewarden-controller
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: kubewarden-controller
spec:
  replicas: 1
"#;

const DEFAULTS_CHART: &str = r#"---
apiVersion: policies.kubewarden.io/v1
kind: PolicyServer
metadata:
  name: default
spec:
  image: ghcr.io/kubewarden/policy-server:latest
  replicas: 1
"#;

#[derive(Default)]
struct ChartState {
    renders: usize,
    failing: HashSet<String>,
    hanging: HashSet<String>,
}

/// Renders fixed manifests for the two Kubewarden charts.
#[derive(Default)]
pub(crate) struct FakeChartRenderer {
    state: Mutex<ChartState>,
}

impl FakeChartRenderer {
    pub fn fail_chart(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    /// Rendering `name` never completes, like helm stuck on a slow chart repository.
    pub fn hang_chart(&self, name: &str) {
        self.state.lock().unwrap().hanging.insert(name.to_string());
    }

    pub fn render_count(&self) -> usize {
        self.state.lock().unwrap().renders
    }
}

#[async_trait]
impl ChartRenderer for FakeChartRenderer {
    async fn render(&self, chart: &ChartRef, _values: &Value) -> Result<String> {
        let hanging = {
            let mut state = self.state.lock().unwrap();
            state.renders += 1;
            state.hanging.contains(&chart.name)
        };
        if hanging {
            return std::future::pending().await;
        }
        let state = self.state.lock().unwrap();
        if state.failing.contains(&chart.name) {
            return Err(OperatorError::ChartRender(format!(
                "helm template {} failed: chart not found",
                chart.name
            )));
        }
        Ok(match chart.name.as_str() {
            "kubewarden-controller" => CONTROLLER_CHART.to_string(),
            "kubewarden-defaults" => DEFAULTS_CHART.to_string(),
            _ => String::new(),
        })
    }
}

const CRDS: &str = r#"---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: clusteradmissionpolicies.policies.kubewarden.io
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: policyservers.policies.kubewarden.io
"#;

/// Serves a fixed CRD bundle for any version.
#[derive(Default)]
pub(crate) struct FakeCrdSource;

#[async_trait]
impl CrdSource for FakeCrdSource {
    async fn crds(&self, _version: &str) -> Result<Vec<Manifest>> {
        Manifest::parse_stream(CRDS)
    }
}

/// An [`AddonReconciler`] wired to fakes.
pub(crate) struct AddonHarness {
    pub clusters: Arc<FakeClusterStore>,
    pub addons: Arc<FakeResourceStore<KubewardenAddon>>,
    pub remotes: Arc<FakeRemoteProvider>,
    pub charts: Arc<FakeChartRenderer>,
    pub reconciler: AddonReconciler,
}

impl AddonHarness {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        let clusters = Arc::new(FakeClusterStore::new(clusters));
        let addons = Arc::new(FakeResourceStore::default());
        let remotes = Arc::new(FakeRemoteProvider::default());
        let charts = Arc::new(FakeChartRenderer::default());
        let reconciler = AddonReconciler::new(
            Arc::clone(&clusters) as Arc<dyn ClusterStore>,
            Arc::clone(&addons) as Arc<dyn ResourceStore<KubewardenAddon>>,
            Arc::clone(&remotes) as Arc<dyn RemoteClientProvider>,
            Arc::clone(&charts) as Arc<dyn ChartRenderer>,
            Arc::new(FakeCrdSource),
            Arc::new(ProviderConfig::default()),
        );
        Self {
            clusters,
            addons,
            remotes,
            charts,
            reconciler,
        }
    }
}

/// A [`PolicyReconciler`] wired to fakes.
pub(crate) struct PolicyHarness {
    pub clusters: Arc<FakeClusterStore>,
    pub policies: Arc<FakeResourceStore<KubewardenPolicy>>,
    pub remotes: Arc<FakeRemoteProvider>,
    pub reconciler: PolicyReconciler,
}

impl PolicyHarness {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        let clusters = Arc::new(FakeClusterStore::new(clusters));
        let policies = Arc::new(FakeResourceStore::default());
        let remotes = Arc::new(FakeRemoteProvider::default());
        let reconciler = PolicyReconciler::new(
            Arc::clone(&clusters) as Arc<dyn ClusterStore>,
            Arc::clone(&policies) as Arc<dyn ResourceStore<KubewardenPolicy>>,
            Arc::clone(&remotes) as Arc<dyn RemoteClientProvider>,
            Arc::new(ProviderConfig::default()),
        );
        Self {
            clusters,
            policies,
            remotes,
            reconciler,
        }
    }
}
