//! Leader election for the scheduler side of the operator.
//!
//! Placement authority must live in one process: the scheduler cache, the
//! namespace workers and the patroller only run on the replica holding the
//! Lease lock. Standbys block in [`LeaderElector::acquire`]; a leader that
//! can no longer renew cancels the leadership token so every leader-owned
//! loop stops before a standby takes over.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lease timing knobs: how long a holder may go silent before takeover, the
/// renew cadence while leading, and the retry cadence while standing by.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub lease_duration: Duration,
    pub renew_interval: Duration,
    pub retry_interval: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Namespace for the leader election lock: explicit flag, then the mounted
/// service account namespace, then `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    const SERVICE_ACCOUNT_NAMESPACE: &str =
        "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    match std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE) {
        Ok(ns) => ns.trim().to_string(),
        Err(_) => "default".to_string(),
    }
}

/// Claims a named `coordination.k8s.io/v1` Lease with optimistic
/// concurrency; 409s on the write path mean another replica won the race.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    lease_name: String,
    identity: String,
    settings: LeaseSettings,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, lease_name: &str, settings: LeaseSettings) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("operator-{:08x}", rand::random::<u32>()));
        info!(
            identity = %identity,
            namespace = %namespace,
            lease = %lease_name,
            "Leader elector initialized"
        );
        Self {
            lease_api,
            lease_name: lease_name.to_string(),
            identity,
            settings,
        }
    }

    /// Block until this replica holds the lock.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, lease = %self.lease_name, "Standing by for leadership");
        loop {
            match self.try_claim().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Lock held elsewhere, standing by");
                }
                Err(e) => {
                    warn!("Leadership claim failed: {}", e);
                }
            }
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    /// Renew on the configured cadence until the lock is lost, then cancel
    /// `leadership` so the scheduler cache, the namespace workers and the
    /// patroller stop before a standby takes over. Returns quietly when the
    /// token is cancelled from the outside (normal shutdown).
    pub async fn run_renewal(self: Arc<Self>, leadership: CancellationToken) {
        loop {
            tokio::select! {
                _ = leadership.cancelled() => return,
                _ = tokio::time::sleep(self.settings.renew_interval) => {}
            }
            let still_leading = match self.renew().await {
                Ok(held) => held,
                Err(e) => {
                    warn!("Lease renewal failed: {}", e);
                    false
                }
            };
            if !still_leading {
                warn!(identity = %self.identity, "Leadership lost, stopping leader-owned loops");
                leadership.cancel();
                return;
            }
        }
    }

    /// One renewal attempt. `Ok(false)` means the lock is gone or held by
    /// another replica.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let Some(lease) = self.lease_api.get_opt(&self.lease_name).await? else {
            return Ok(false);
        };
        if !self.held_by_us(&lease) {
            return Ok(false);
        }
        self.write_claim(lease, false).await
    }

    /// Hand the lock back so a standby can take over without waiting out
    /// the lease duration. Failing to release only costs the standby that
    /// wait, so errors are logged and swallowed.
    pub async fn release(&self) {
        let lease = match self.lease_api.get_opt(&self.lease_name).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return,
            Err(e) => {
                warn!("Could not read lease for release: {}", e);
                return;
            }
        };
        if !self.held_by_us(&lease) {
            return;
        }

        let mut returned = lease;
        if let Some(spec) = returned.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &returned)
            .await
        {
            Ok(_) => info!("Leadership released"),
            Err(e) => warn!("Could not release leadership: {}", e),
        }
    }

    fn held_by_us(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    fn expired(&self, spec: Option<&LeaseSpec>) -> bool {
        let budget = spec
            .and_then(|s| s.lease_duration_seconds)
            .map(i64::from)
            .unwrap_or(self.settings.lease_duration.as_secs() as i64);
        match spec.and_then(|s| s.renew_time.as_ref()) {
            Some(MicroTime(at)) => Utc::now().signed_duration_since(*at).num_seconds() > budget,
            None => true,
        }
    }

    async fn try_claim(&self) -> anyhow::Result<bool> {
        match self.lease_api.get_opt(&self.lease_name).await? {
            None => self.create_claim().await,
            Some(lease) if self.held_by_us(&lease) => self.write_claim(lease, false).await,
            Some(lease) if self.expired(lease.spec.as_ref()) => self.write_claim(lease, true).await,
            Some(_) => Ok(false),
        }
    }

    /// Our claim over the lock: a takeover stamps a new acquire time and
    /// bumps the transition counter, a renewal only moves the renew time.
    fn claim_spec(&self, previous: Option<&LeaseSpec>, takeover: bool) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        let transitions = previous.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.settings.lease_duration.as_secs() as i32),
            acquire_time: if takeover || previous.is_none() {
                Some(now.clone())
            } else {
                previous.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        }
    }

    async fn create_claim(&self) -> anyhow::Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(self.claim_spec(None, false)),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_claim(&self, existing: Lease, takeover: bool) -> anyhow::Result<bool> {
        let spec = self.claim_spec(existing.spec.as_ref(), takeover);
        let mut claimed = existing;
        claimed.spec = Some(spec);
        match self
            .lease_api
            .replace(&self.lease_name, &PostParams::default(), &claimed)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
