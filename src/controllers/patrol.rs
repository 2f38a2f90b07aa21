//! Periodic patrol of super cluster namespaces against tenant intent.
//!
//! Every interval the patroller builds two sets: vSet, the namespaces every
//! tenant declares, keyed in super-cluster scope, and pSet, the super
//! cluster namespaces carrying tenant ownership annotations. Their
//! difference drives re-queues into the namespace reconciler and garbage
//! collection of orphans. GC decisions are always double-checked against
//! the authoritative API server so a stale cache can never delete a live
//! tenant's namespace.

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, ListParams, Preconditions};
use kube::Client;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::{
    ANNOTATION_TENANT_NS_UID, ANNOTATION_VC_NAME, ANNOTATION_VC_NAMESPACE, ANNOTATION_VC_ROOT_NS,
    ANNOTATION_VC_UID,
};
use crate::controllers::namespace::ReconcileKey;
use crate::crd::VirtualCluster;
use crate::error::Result;
use crate::tenant::TenantGateway;
use crate::workqueue::WorkQueue;

/// Remedy counters, surfaced through the logs on every patrol round.
#[derive(Default)]
pub struct PatrolMetrics {
    pub requeued_tenant_namespaces: AtomicU64,
    pub deleted_orphan_namespaces: AtomicU64,
}

/// Name a tenant namespace takes in super-cluster scope.
pub fn super_cluster_namespace(cluster_key: &str, ns_name: &str) -> String {
    format!("{}-{}", cluster_key, ns_name)
}

/// Derive the owner cluster key from a super cluster namespace's ownership
/// annotations; None when any back-reference is missing.
pub fn owner_cluster_of(annotations: &BTreeMap<String, String>) -> Option<String> {
    let vc_name = annotations.get(ANNOTATION_VC_NAME)?;
    let vc_namespace = annotations.get(ANNOTATION_VC_NAMESPACE)?;
    let vc_uid = annotations.get(ANNOTATION_VC_UID)?;
    if vc_name.is_empty() || vc_namespace.is_empty() || vc_uid.is_empty() {
        return None;
    }
    let uid_prefix: String = vc_uid.chars().filter(|c| *c != '-').take(6).collect();
    Some(format!("{}-{}-{}", vc_namespace, uid_prefix, vc_name))
}

/// Annotation prefixes the operator owns; these never count as drift.
const IGNORED_ANNOTATION_PREFIXES: [&str; 4] = [
    "tenancy.x-k8s.io/",
    "scheduled.tenancy.x-k8s.io/",
    "scheduling.tenancy.x-k8s.io/",
    "transparency.tenancy.x-k8s.io/",
];

fn filtered_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    annotations
        .iter()
        .filter(|(k, _)| {
            !IGNORED_ANNOTATION_PREFIXES
                .iter()
                .any(|prefix| k.starts_with(prefix))
            && !k.starts_with("kubernetes.io/")
        })
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// True when labels or non-operator annotations differ between the tenant
/// namespace and its super cluster projection.
pub fn metadata_drifted(v: &Namespace, p: &Namespace) -> bool {
    let empty = BTreeMap::new();
    let v_labels = v.metadata.labels.as_ref().unwrap_or(&empty);
    let p_labels = p.metadata.labels.as_ref().unwrap_or(&empty);
    if v_labels != p_labels {
        return true;
    }
    let v_annotations = v.metadata.annotations.as_ref().unwrap_or(&empty);
    let p_annotations = p.metadata.annotations.as_ref().unwrap_or(&empty);
    filtered_annotations(v_annotations) != filtered_annotations(p_annotations)
}

struct VEntry {
    cluster: String,
    name: String,
    namespace: Namespace,
}

pub struct Patroller {
    client: Client,
    tenants: Arc<dyn TenantGateway>,
    queue: Arc<WorkQueue<ReconcileKey>>,
    period: Duration,
    pub metrics: Arc<PatrolMetrics>,
}

impl Patroller {
    pub fn new(
        client: Client,
        tenants: Arc<dyn TenantGateway>,
        queue: Arc<WorkQueue<ReconcileKey>>,
        period: Duration,
    ) -> Self {
        Self {
            client,
            tenants,
            queue,
            period,
            metrics: Arc::new(PatrolMetrics::default()),
        }
    }

    /// Patrol on a fixed period until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(period_secs = self.period.as_secs(), "Starting namespace patroller");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
            if let Err(e) = self.patrol_once().await {
                error!("Patrol round failed: {}", e);
            }
            info!(
                requeued = self.metrics.requeued_tenant_namespaces.load(Ordering::Relaxed),
                deleted = self.metrics.deleted_orphan_namespaces.load(Ordering::Relaxed),
                "Patrol round complete"
            );
        }
    }

    /// One full reconciliation of the super cluster namespace set.
    pub async fn patrol_once(&self) -> Result<()> {
        let cluster_keys = self.tenants.cluster_keys().await;
        if cluster_keys.is_empty() {
            info!("No tenant control planes connected, patrolling for gc only");
        }

        // pSet: super cluster namespaces claiming tenant ownership
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let p_list = namespaces.list(&ListParams::default()).await?;
        let mut p_set: HashMap<String, Namespace> = HashMap::new();
        for namespace in p_list.items {
            let owned = namespace
                .metadata
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(ANNOTATION_VC_UID));
            if owned {
                if let Some(name) = namespace.metadata.name.clone() {
                    p_set.insert(name, namespace);
                }
            }
        }

        // vSet: tenant-declared namespaces, keyed in super-cluster scope
        let mut known_clusters: HashSet<String> = cluster_keys.iter().cloned().collect();
        let mut v_set: HashMap<String, VEntry> = HashMap::new();
        for cluster in &cluster_keys {
            let listed = match self.tenants.list_namespaces(cluster).await {
                Ok(listed) => listed,
                Err(e) => {
                    warn!(cluster = %cluster, "Tenant namespace listing failed: {}", e);
                    known_clusters.remove(cluster);
                    continue;
                }
            };
            for namespace in listed {
                let Some(name) = namespace.metadata.name.clone() else {
                    continue;
                };
                v_set.insert(
                    super_cluster_namespace(cluster, &name),
                    VEntry {
                        cluster: cluster.clone(),
                        name,
                        namespace,
                    },
                );
            }
        }

        // tenant namespaces whose projection is missing or drifted
        for (key, v_entry) in &v_set {
            match p_set.get(key) {
                None => {
                    self.queue
                        .add((v_entry.cluster.clone(), v_entry.name.clone()));
                    self.metrics
                        .requeued_tenant_namespaces
                        .fetch_add(1, Ordering::Relaxed);
                }
                Some(p_obj) => {
                    let v_uid = v_entry.namespace.metadata.uid.clone().unwrap_or_default();
                    let p_tenant_uid = p_obj
                        .metadata
                        .annotations
                        .as_ref()
                        .and_then(|a| a.get(ANNOTATION_TENANT_NS_UID).cloned())
                        .unwrap_or_default();
                    let uid_mismatch = !p_tenant_uid.is_empty() && p_tenant_uid != v_uid;

                    if uid_mismatch || self.should_be_garbage_collected(p_obj).await {
                        self.delete_namespace(p_obj).await;
                    } else if metadata_drifted(&v_entry.namespace, p_obj) {
                        warn!(namespace = %key, "Super cluster namespace metadata drifted");
                        self.delete_namespace(p_obj).await;
                        self.queue
                            .add((v_entry.cluster.clone(), v_entry.name.clone()));
                        self.metrics
                            .requeued_tenant_namespaces
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        // super cluster namespaces no tenant declares
        for (key, p_obj) in &p_set {
            if v_set.contains_key(key) {
                continue;
            }
            let annotations = p_obj.metadata.annotations.clone().unwrap_or_default();

            // the root namespace only goes when its VirtualCluster is gone
            if annotations.get(ANNOTATION_VC_ROOT_NS).map(String::as_str) == Some("true") {
                if self.should_be_garbage_collected(p_obj).await {
                    self.delete_namespace(p_obj).await;
                }
                continue;
            }

            match owner_cluster_of(&annotations) {
                // owning tenant is connected and does not declare this
                // namespace: the usual orphan
                Some(owner) if known_clusters.contains(&owner) => {
                    self.delete_namespace(p_obj).await;
                }
                // tenant unknown or not loaded: confirm against the source
                // of truth before reaping
                _ => {
                    if self.should_be_garbage_collected(p_obj).await {
                        self.delete_namespace(p_obj).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// True iff a fresh lookup of the referenced VirtualCluster reports
    /// NotFound or a different UID. The lookup always goes to the API
    /// server, never a cache.
    async fn should_be_garbage_collected(&self, p_obj: &Namespace) -> bool {
        let annotations = p_obj.metadata.annotations.clone().unwrap_or_default();
        let (Some(vc_name), Some(vc_namespace)) = (
            annotations.get(ANNOTATION_VC_NAME),
            annotations.get(ANNOTATION_VC_NAMESPACE),
        ) else {
            return false;
        };
        if vc_name.is_empty() || vc_namespace.is_empty() {
            return false;
        }

        let vcs: Api<VirtualCluster> = Api::namespaced(self.client.clone(), vc_namespace);
        match vcs.get_opt(vc_name).await {
            Ok(None) => true,
            Ok(Some(vc)) => {
                let live_uid = vc.metadata.uid.unwrap_or_default();
                annotations.get(ANNOTATION_VC_UID).map(String::as_str) != Some(live_uid.as_str())
            }
            Err(e) => {
                warn!(
                    vc = %format!("{}/{}", vc_namespace, vc_name),
                    "GC verification lookup failed, keeping namespace: {}", e
                );
                false
            }
        }
    }

    /// Delete with a UID precondition so a namespace re-created under a new
    /// UID is never reaped by a stale decision.
    async fn delete_namespace(&self, namespace: &Namespace) {
        let Some(name) = namespace.metadata.name.clone() else {
            return;
        };
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: namespace.metadata.uid.clone(),
                resource_version: None,
            }),
            ..Default::default()
        };
        match namespaces.delete(&name, &params).await {
            Ok(_) => {
                info!(namespace = %name, "Deleted orphaned super cluster namespace");
                self.metrics
                    .deleted_orphan_namespaces
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => {
                error!(namespace = %name, "Failed to delete orphaned namespace: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn ns(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_super_cluster_namespace_key() {
        assert_eq!(
            super_cluster_namespace("vc-a-6a2d1c-demo", "web"),
            "vc-a-6a2d1c-demo-web"
        );
    }

    #[test]
    fn test_owner_cluster_is_derived_from_annotations() {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_VC_NAME.to_string(), "demo".to_string());
        annotations.insert(ANNOTATION_VC_NAMESPACE.to_string(), "vc-a".to_string());
        annotations.insert(
            ANNOTATION_VC_UID.to_string(),
            "6a2d1c4e-9f30-4bfa-8d5c-0123456789ab".to_string(),
        );
        assert_eq!(
            owner_cluster_of(&annotations).as_deref(),
            Some("vc-a-6a2d1c-demo")
        );

        annotations.remove(ANNOTATION_VC_UID);
        assert!(owner_cluster_of(&annotations).is_none());
    }

    #[test]
    fn test_label_drift_is_detected() {
        let v = ns(&[("team", "a")], &[]);
        let p = ns(&[("team", "b")], &[]);
        assert!(metadata_drifted(&v, &p));

        let p_same = ns(&[("team", "a")], &[]);
        assert!(!metadata_drifted(&v, &p_same));
    }

    #[test]
    fn test_operator_annotations_never_count_as_drift() {
        let v = ns(&[], &[("owner", "alice")]);
        let p = ns(
            &[],
            &[
                ("owner", "alice"),
                (ANNOTATION_VC_UID, "u1"),
                (ANNOTATION_VC_ROOT_NS, "true"),
                ("scheduled.tenancy.x-k8s.io/placements", r#"{"c1":1}"#),
            ],
        );
        assert!(!metadata_drifted(&v, &p));
    }

    #[test]
    fn test_foreign_annotation_drift_is_detected() {
        let v = ns(&[], &[("owner", "alice")]);
        let p = ns(&[], &[("owner", "bob"), (ANNOTATION_VC_UID, "u1")]);
        assert!(metadata_drifted(&v, &p));
    }
}
