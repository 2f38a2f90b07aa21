//! Tenant connection management and scheduler cache warm-up.
//!
//! The elected leader discovers Ready VirtualClusters, connects their API
//! servers through the gateway and rebuilds the scheduler cache from the
//! placements each tenant namespace already carries. A tenant stays in the
//! dirty set until its warm-up finishes; placements that no longer fit
//! trigger a reschedule instead of being trusted.

use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::ANNOTATION_SCHEDULED_PLACEMENTS;
use crate::controllers::namespace::{ReconcileKey, SliceResolver};
use crate::crd::{VirtualCluster, VirtualClusterPhase};
use crate::error::Result;
use crate::scheduler::{parse_placements, DirtyVirtualClusters, SchedulerEngine};
use crate::tenant::{KubeTenantGateway, TenantGateway, TenantOwner};
use crate::workqueue::WorkQueue;

/// How often tenant membership is refreshed.
const DISCOVERY_PERIOD: Duration = Duration::from_secs(30);

pub struct TenantRegistrar {
    client: Client,
    gateway: Arc<KubeTenantGateway>,
    engine: Arc<SchedulerEngine>,
    slices: Arc<dyn SliceResolver>,
    dirty: Arc<DirtyVirtualClusters>,
    queue: Arc<WorkQueue<ReconcileKey>>,
}

impl TenantRegistrar {
    pub fn new(
        client: Client,
        gateway: Arc<KubeTenantGateway>,
        engine: Arc<SchedulerEngine>,
        slices: Arc<dyn SliceResolver>,
        dirty: Arc<DirtyVirtualClusters>,
        queue: Arc<WorkQueue<ReconcileKey>>,
    ) -> Self {
        Self {
            client,
            gateway,
            engine,
            slices,
            dirty,
            queue,
        }
    }

    /// Refresh tenant membership on a fixed period until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting tenant registrar");
        loop {
            if let Err(e) = self.sync_tenants().await {
                error!("Tenant discovery failed: {}", e);
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(DISCOVERY_PERIOD) => {}
            }
        }
    }

    /// Connect newly Ready tenants, drop gone ones.
    pub async fn sync_tenants(&self) -> Result<()> {
        let vcs: Api<VirtualCluster> = Api::all(self.client.clone());
        let listed = vcs.list(&ListParams::default()).await?;

        let connected = self.gateway.cluster_keys().await;
        let mut live_keys = Vec::new();

        for vc in &listed.items {
            let ready = vc
                .status
                .as_ref()
                .is_some_and(|s| s.phase == VirtualClusterPhase::Ready);
            if !ready {
                continue;
            }
            let cluster_key = vc.root_namespace();
            live_keys.push(cluster_key.clone());
            if connected.contains(&cluster_key) {
                continue;
            }

            let owner = TenantOwner {
                vc_namespace: vc.namespace().unwrap_or_default(),
                vc_name: vc.name_any(),
                vc_uid: vc.metadata.uid.clone().unwrap_or_default(),
            };
            // dirty until the cache entry is warmed; namespace reconciles
            // for this tenant re-queue meanwhile
            self.dirty.mark(&owner.vc_key());
            match self
                .gateway
                .register_from_secret(self.client.clone(), &cluster_key, owner.clone())
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.warm_tenant(&cluster_key, &owner).await {
                        warn!(cluster = %cluster_key, "Cache warm-up failed: {}", e);
                    }
                    self.dirty.clear(&owner.vc_key());
                }
                Err(e) => {
                    warn!(cluster = %cluster_key, "Tenant connection failed: {}", e);
                }
            }
        }

        // drop tenants whose VirtualCluster is gone and free their slices
        for cluster_key in connected {
            if live_keys.contains(&cluster_key) {
                continue;
            }
            self.gateway.deregister(&cluster_key).await;
            let prefix = format!("{}/", cluster_key);
            for ns_key in self.engine.cache().reserved_keys() {
                if ns_key.starts_with(&prefix) {
                    self.engine.deschedule_namespace(&ns_key);
                }
            }
        }

        Ok(())
    }

    /// Rebuild the cache from one tenant's persisted placement annotations.
    /// Namespaces whose placements cannot be accommodated are enqueued for
    /// rescheduling.
    async fn warm_tenant(&self, cluster_key: &str, owner: &TenantOwner) -> Result<()> {
        let slice = self.slices.slice_for(owner).await?;
        let namespaces = self.gateway.list_namespaces(cluster_key).await?;

        let mut warmed = 0usize;
        for namespace in namespaces {
            let Some(name) = namespace.metadata.name.clone() else {
                continue;
            };
            let annotation = namespace
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_SCHEDULED_PLACEMENTS).cloned());
            let placements = match parse_placements(annotation.as_deref()) {
                Ok(p) if !p.is_empty() => p,
                Ok(_) => continue,
                Err(e) => {
                    warn!(cluster = %cluster_key, namespace = %name, "Bad placements annotation: {}", e);
                    self.queue.add((cluster_key.to_string(), name));
                    continue;
                }
            };
            let ns_key = format!("{}/{}", cluster_key, name);
            match self.engine.cache().ensure(&ns_key, slice, &placements) {
                Ok(()) => warmed += 1,
                Err(e) => {
                    warn!(
                        namespace = %ns_key,
                        "Persisted placements no longer fit, rescheduling: {}",
                        e
                    );
                    self.queue.add((cluster_key.to_string(), name));
                }
            }
        }
        info!(cluster = %cluster_key, warmed, "Scheduler cache warmed for tenant");
        Ok(())
    }
}
