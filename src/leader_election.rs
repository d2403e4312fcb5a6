//! Lease-based leader election
//!
//! Several provider replicas may run side by side; only the holder of the
//! `coordination.k8s.io/v1` Lease runs the controllers. The others wait in
//! [`LeaderElector::acquire`] until the lease expires.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_LEASE_NAME: &str = "kubewarden-addon-provider-leader";

const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace for the Lease: the explicit value, else the pod's own namespace, else "default".
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Whether the lease can be taken over at `now`.
fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) => now.signed_duration_since(*renewed).num_seconds() > duration_secs,
        None => true,
    }
}

/// Lease spec held by `identity`. A takeover starts a new term.
fn held_by(identity: &str, previous: Option<&LeaseSpec>, now: &MicroTime, takeover: bool) -> LeaseSpec {
    let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION_SECS),
        acquire_time: match previous {
            Some(prev) if !takeover => prev.acquire_time.clone(),
            _ => Some(now.clone()),
        },
        renew_time: Some(now.clone()),
        lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
        ..Default::default()
    }
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

pub struct LeaderElector {
    lease_api: Api<Lease>,
    lease_name: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("kubewarden-addon-provider-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, lease = %lease_name, "Initialized leader elector");
        Self {
            lease_api,
            lease_name: lease_name.to_string(),
            identity,
        }
    }

    /// Blocks until the lease is acquired.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{}'", self.lease_name);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Lease held by another replica, retrying in {:?}", RETRY_INTERVAL);
                }
                Err(e) => {
                    warn!("Lease acquisition error: {}, retrying in {:?}", e, RETRY_INTERVAL);
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renews the lease. `Ok(false)` means leadership was lost.
    pub async fn renew(&self) -> Result<bool> {
        let lease = self.lease_api.get(&self.lease_name).await?;
        if holder(&lease) != Some(self.identity.as_str()) {
            return Ok(false);
        }
        let now = MicroTime(Utc::now());
        let won = self.write(&lease, held_by(&self.identity, lease.spec.as_ref(), &now, false)).await?;
        if won {
            debug!("Renewed leader lease");
        } else {
            warn!("Lease conflict during renewal, lost leadership");
        }
        Ok(won)
    }

    /// Gives the lease up so a standby replica can take over without waiting for expiry.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };
        if holder(&lease) != Some(self.identity.as_str()) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut spec = lease.spec.clone().unwrap_or_default();
        spec.holder_identity = None;
        match self.write(&lease, spec).await {
            Ok(true) => info!("Released leader lease"),
            Ok(false) => debug!("Lease changed before release"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    pub fn renew_interval(&self) -> Duration {
        RENEW_INTERVAL
    }

    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        match self.lease_api.get(&self.lease_name).await {
            Ok(existing) => {
                let spec = existing.spec.as_ref();
                if holder(&existing) == Some(self.identity.as_str()) {
                    self.write(&existing, held_by(&self.identity, spec, &now, false)).await
                } else if is_expired(spec, now.0) {
                    self.write(&existing, held_by(&self.identity, spec, &now, true)).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => self.create(&now).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, now: &MicroTime) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(held_by(&self.identity, None, now, false)),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) => match OperatorError::from(e) {
                OperatorError::Conflict(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    /// Replace the lease spec, guarded by the resourceVersion of `existing`. `Ok(false)` on conflict.
    async fn write(&self, existing: &Lease, spec: LeaseSpec) -> Result<bool> {
        let mut updated = existing.clone();
        updated.spec = Some(spec);
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match OperatorError::from(e) {
                OperatorError::Conflict(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
