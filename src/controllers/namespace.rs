//! Tenant namespace reconciler.
//!
//! One worker pool pulls `(cluster, namespace)` keys off a deduplicating
//! queue and drives each tenant namespace to a placement whose slice total
//! matches its quota envelope. The cache commits before any annotation is
//! published, and releases before the annotation is cleared, so the cache
//! never holds a placement the tenant cannot observe.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::{ANNOTATION_CLUSTER_SELECTOR, ANNOTATION_SCHEDULED_PLACEMENTS};
use crate::crd::{ClusterVersion, VirtualCluster};
use crate::error::{OperatorError, Result};
use crate::quota::{self, ResourceVector};
use crate::scheduler::cache::{total_slices, Placement};
use crate::scheduler::{
    parse_cluster_selector, parse_placements, render_placements, DirtyVirtualClusters,
    NamespaceCandidate, ScheduleResult, SchedulerEngine,
};
use crate::tenant::{TenantGateway, TenantOwner};
use crate::workqueue::WorkQueue;

/// Reconcile key: owning tenant (cluster key) and namespace name.
pub type ReconcileKey = (String, String);

/// Re-queue delay while the owning tenant's cache entry is still warming.
const DIRTY_REQUEUE: Duration = Duration::from_secs(5);
/// Attempts at the optimistic-concurrency annotation write.
const CONFLICT_RETRIES: usize = 5;
/// Re-queue delay after transient errors.
const TRANSIENT_REQUEUE: Duration = Duration::from_secs(10);
/// Longer cadence for capacity errors; capacity may be freed by others.
const CAPACITY_REQUEUE: Duration = Duration::from_secs(60);

/// Resolves the scheduling slice of the ClusterVersion owning a tenant.
#[async_trait]
pub trait SliceResolver: Send + Sync {
    async fn slice_for(&self, owner: &TenantOwner) -> Result<ResourceVector>;
}

/// Looks the slice up through VirtualCluster → ClusterVersion on the host.
pub struct CrdSliceResolver {
    client: Client,
}

impl CrdSliceResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SliceResolver for CrdSliceResolver {
    async fn slice_for(&self, owner: &TenantOwner) -> Result<ResourceVector> {
        let vcs: Api<VirtualCluster> = Api::namespaced(self.client.clone(), &owner.vc_namespace);
        let vc = vcs.get(&owner.vc_name).await?;
        let cvs: Api<ClusterVersion> = Api::all(self.client.clone());
        let cv = cvs
            .get(&vc.spec.cluster_version_name)
            .await
            .map_err(|_| OperatorError::ClusterVersionNotFound(vc.spec.cluster_version_name.clone()))?;
        cv.spec.scheduling_slice.to_vector()
    }
}

pub struct NamespaceReconciler {
    engine: Arc<SchedulerEngine>,
    tenants: Arc<dyn TenantGateway>,
    slices: Arc<dyn SliceResolver>,
    dirty: Arc<DirtyVirtualClusters>,
    queue: Arc<WorkQueue<ReconcileKey>>,
}

impl NamespaceReconciler {
    pub fn new(
        engine: Arc<SchedulerEngine>,
        tenants: Arc<dyn TenantGateway>,
        slices: Arc<dyn SliceResolver>,
        dirty: Arc<DirtyVirtualClusters>,
    ) -> Self {
        Self {
            engine,
            tenants,
            slices,
            dirty,
            queue: WorkQueue::new(),
        }
    }

    /// The queue other components (patroller, resync) enqueue into.
    pub fn queue(&self) -> Arc<WorkQueue<ReconcileKey>> {
        Arc::clone(&self.queue)
    }

    /// Enqueue every namespace of every connected tenant.
    pub async fn resync(&self) {
        for cluster in self.tenants.cluster_keys().await {
            match self.tenants.list_namespaces(&cluster).await {
                Ok(namespaces) => {
                    for ns in namespaces {
                        if let Some(name) = ns.metadata.name {
                            self.queue.add((cluster.clone(), name));
                        }
                    }
                }
                Err(e) => {
                    warn!(cluster = %cluster, "Namespace resync listing failed: {}", e);
                }
            }
        }
    }

    /// Run `workers` reconcile loops until the token is cancelled. Distinct
    /// keys reconcile in parallel; a queued key is held only once.
    pub async fn run_workers(self: Arc<Self>, workers: usize, shutdown: CancellationToken) {
        info!(workers, "Starting namespace reconcile workers");
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let reconciler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        key = reconciler.queue.pop() => key,
                    };
                    let outcome = reconciler.reconcile(&key).await;
                    reconciler.queue.done(&key);
                    match outcome {
                        Ok(Some(delay)) => reconciler.queue.add_after(key, delay),
                        Ok(None) => {}
                        Err(e) => {
                            error!(
                                worker,
                                cluster = %key.0,
                                namespace = %key.1,
                                "Namespace reconcile failed: {}",
                                e
                            );
                            let delay = match e {
                                OperatorError::InsufficientCapacity(_)
                                | OperatorError::OverCapacity(_) => CAPACITY_REQUEUE,
                                _ => TRANSIENT_REQUEUE,
                            };
                            reconciler.queue.add_after(key, delay);
                        }
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Reconcile one tenant namespace. `Ok(Some(d))` asks for a re-queue
    /// after at least `d`.
    pub async fn reconcile(&self, key: &ReconcileKey) -> Result<Option<Duration>> {
        let (cluster, ns_name) = key;
        let ns_key = format!("{}/{}", cluster, ns_name);
        info!(cluster = %cluster, namespace = %ns_name, "Reconciling tenant namespace");

        let owner = self.tenants.owner_info(cluster).await?;
        if self.dirty.contains(&owner.vc_key()) {
            warn!(vc = %owner.vc_key(), "Owning tenant cache is still warming");
            return Ok(Some(DIRTY_REQUEUE));
        }

        let Some(namespace) = self.tenants.get_namespace(cluster, ns_name).await? else {
            info!(namespace = %ns_key, "Tenant namespace is gone, releasing placements");
            self.engine.deschedule_namespace(&ns_key);
            return Ok(None);
        };

        let quotas = self.tenants.list_resource_quotas(cluster, ns_name).await?;
        let quota = quota::max_quota(&quotas);

        let annotations = namespace.metadata.annotations.clone().unwrap_or_default();
        let placements = parse_placements(
            annotations
                .get(ANNOTATION_SCHEDULED_PLACEMENTS)
                .map(String::as_str),
        )?;
        let selector = parse_cluster_selector(
            annotations
                .get(ANNOTATION_CLUSTER_SELECTOR)
                .map(String::as_str),
        )?;
        let slice = self.slices.slice_for(&owner).await?;

        let candidate = NamespaceCandidate {
            owner_cluster: cluster.clone(),
            name: ns_name.clone(),
            labels: namespace.metadata.labels.clone().unwrap_or_default(),
            selector,
            quota,
            slice,
            placements: placements.clone(),
        };

        let expected = candidate.expected_slices();
        if expected == 0 {
            // release before the annotation disappears so the cache never
            // holds more than the tenant can observe
            self.engine.deschedule_namespace(&ns_key);
            self.update_scheduling_result(cluster, &namespace, None)
                .await?;
            return Ok(None);
        }

        if total_slices(&placements) == expected {
            self.engine.ensure_namespace_placements(&candidate)?;
            return Ok(None);
        }

        match self.engine.schedule_namespace(&candidate) {
            Ok(ScheduleResult::Scheduled(new_placements)) => {
                self.update_scheduling_result(cluster, &namespace, Some(&new_placements))
                    .await?;
                let rendered = render_placements(&new_placements);
                info!(namespace = %ns_key, placements = %rendered, "Scheduled tenant namespace");
                let _ = self
                    .tenants
                    .publish_event(
                        cluster,
                        ns_name,
                        "Normal",
                        "Scheduled",
                        &format!("Successfully scheduled namespace with placement {}", rendered),
                    )
                    .await;
                Ok(None)
            }
            Ok(ScheduleResult::DeScheduled) => {
                self.update_scheduling_result(cluster, &namespace, None)
                    .await?;
                Ok(None)
            }
            Err(e) => {
                let _ = self
                    .tenants
                    .publish_event(
                        cluster,
                        ns_name,
                        "Warning",
                        "Failed",
                        &format!("Failed to schedule namespace: {}", e),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Compare-and-swap write of the placements annotation, refetching the
    /// namespace on conflict.
    async fn update_scheduling_result(
        &self,
        cluster: &str,
        namespace: &Namespace,
        placements: Option<&[Placement]>,
    ) -> Result<()> {
        let ns_name = namespace.metadata.name.clone().unwrap_or_default();
        let mut current = namespace.clone();

        for attempt in 0..CONFLICT_RETRIES {
            let annotations = current.metadata.annotations.get_or_insert_with(Default::default);
            match placements {
                Some(p) => {
                    annotations
                        .insert(ANNOTATION_SCHEDULED_PLACEMENTS.to_string(), render_placements(p));
                }
                None => {
                    annotations.remove(ANNOTATION_SCHEDULED_PLACEMENTS);
                }
            }

            match self.tenants.update_namespace(cluster, &current).await {
                Ok(_) => return Ok(()),
                Err(OperatorError::Conflict(_)) => {
                    warn!(
                        cluster = %cluster,
                        namespace = %ns_name,
                        attempt,
                        "Annotation write conflicted, refetching"
                    );
                    match self.tenants.get_namespace(cluster, &ns_name).await? {
                        Some(fresh) => current = fresh,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(OperatorError::Conflict(format!(
            "annotation write on {}/{} kept conflicting",
            cluster, ns_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ResourceQuota, ResourceQuotaSpec};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use crate::scheduler::cache::SchedulerCache;

    struct MockGateway {
        owner: TenantOwner,
        namespaces: Mutex<HashMap<(String, String), Namespace>>,
        quotas: Mutex<HashMap<(String, String), Vec<ResourceQuota>>>,
        events: Mutex<Vec<(String, String)>>,
    }

    impl MockGateway {
        fn new() -> Self {
            Self {
                owner: TenantOwner {
                    vc_namespace: "vc-a".to_string(),
                    vc_name: "demo".to_string(),
                    vc_uid: "uid-1".to_string(),
                },
                namespaces: Mutex::new(HashMap::new()),
                quotas: Mutex::new(HashMap::new()),
                events: Mutex::new(Vec::new()),
            }
        }

        fn insert_namespace(&self, cluster: &str, name: &str, annotations: BTreeMap<String, String>) {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                ..Default::default()
            };
            self.namespaces
                .lock()
                .unwrap()
                .insert((cluster.to_string(), name.to_string()), ns);
        }

        fn insert_quota(&self, cluster: &str, ns: &str, cpu: &str, memory: &str) {
            let mut hard = BTreeMap::new();
            hard.insert("cpu".to_string(), Quantity(cpu.to_string()));
            hard.insert("memory".to_string(), Quantity(memory.to_string()));
            let quota = ResourceQuota {
                spec: Some(ResourceQuotaSpec {
                    hard: Some(hard),
                    ..Default::default()
                }),
                ..Default::default()
            };
            self.quotas
                .lock()
                .unwrap()
                .insert((cluster.to_string(), ns.to_string()), vec![quota]);
        }

        fn annotation(&self, cluster: &str, ns: &str) -> Option<String> {
            self.namespaces
                .lock()
                .unwrap()
                .get(&(cluster.to_string(), ns.to_string()))
                .and_then(|n| n.metadata.annotations.as_ref())
                .and_then(|a| a.get(ANNOTATION_SCHEDULED_PLACEMENTS).cloned())
        }
    }

    #[async_trait]
    impl TenantGateway for MockGateway {
        async fn cluster_keys(&self) -> Vec<String> {
            vec!["t1".to_string()]
        }

        async fn owner_info(&self, _cluster_key: &str) -> Result<TenantOwner> {
            Ok(self.owner.clone())
        }

        async fn get_namespace(&self, cluster_key: &str, name: &str) -> Result<Option<Namespace>> {
            Ok(self
                .namespaces
                .lock()
                .unwrap()
                .get(&(cluster_key.to_string(), name.to_string()))
                .cloned())
        }

        async fn list_namespaces(&self, cluster_key: &str) -> Result<Vec<Namespace>> {
            Ok(self
                .namespaces
                .lock()
                .unwrap()
                .iter()
                .filter(|((c, _), _)| c == cluster_key)
                .map(|(_, ns)| ns.clone())
                .collect())
        }

        async fn list_resource_quotas(
            &self,
            cluster_key: &str,
            namespace: &str,
        ) -> Result<Vec<ResourceQuota>> {
            Ok(self
                .quotas
                .lock()
                .unwrap()
                .get(&(cluster_key.to_string(), namespace.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn update_namespace(
            &self,
            cluster_key: &str,
            namespace: &Namespace,
        ) -> Result<Namespace> {
            let name = namespace.metadata.name.clone().unwrap_or_default();
            self.namespaces
                .lock()
                .unwrap()
                .insert((cluster_key.to_string(), name), namespace.clone());
            Ok(namespace.clone())
        }

        async fn publish_event(
            &self,
            _cluster_key: &str,
            ns_name: &str,
            _event_type: &str,
            reason: &str,
            _message: &str,
        ) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push((ns_name.to_string(), reason.to_string()));
            Ok(())
        }
    }

    struct FixedSlice(ResourceVector);

    #[async_trait]
    impl SliceResolver for FixedSlice {
        async fn slice_for(&self, _owner: &TenantOwner) -> Result<ResourceVector> {
            Ok(self.0)
        }
    }

    fn reconciler_with(
        clusters: &[(&str, i64, i64)],
        gateway: Arc<MockGateway>,
    ) -> NamespaceReconciler {
        let cache = Arc::new(SchedulerCache::new());
        for (name, cpu, mem) in clusters {
            cache.add_cluster(name, BTreeMap::new(), ResourceVector::new(*cpu, *mem));
        }
        NamespaceReconciler::new(
            Arc::new(SchedulerEngine::new(cache)),
            gateway,
            Arc::new(FixedSlice(ResourceVector::new(2000, 4 * (1 << 30)))),
            Arc::new(DirtyVirtualClusters::new()),
        )
    }

    #[tokio::test]
    async fn test_scheduling_fit_spills_across_clusters() {
        let gateway = Arc::new(MockGateway::new());
        gateway.insert_namespace("t1", "web", BTreeMap::new());
        gateway.insert_quota("t1", "web", "8", "16Gi");

        let reconciler = reconciler_with(
            &[("c1", 6000, 12 * (1 << 30)), ("c2", 6000, 12 * (1 << 30))],
            Arc::clone(&gateway),
        );

        let requeue = reconciler
            .reconcile(&("t1".to_string(), "web".to_string()))
            .await
            .unwrap();
        assert!(requeue.is_none());
        assert_eq!(
            gateway.annotation("t1", "web").as_deref(),
            Some(r#"{"c1":3,"c2":1}"#)
        );
        assert_eq!(
            gateway.events.lock().unwrap().as_slice(),
            &[("web".to_string(), "Scheduled".to_string())]
        );
    }

    #[tokio::test]
    async fn test_quota_gone_releases_and_unannotates() {
        let gateway = Arc::new(MockGateway::new());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_SCHEDULED_PLACEMENTS.to_string(),
            r#"{"c1":2}"#.to_string(),
        );
        gateway.insert_namespace("t1", "web", annotations);
        // no quota inserted: envelope is zero

        let reconciler = reconciler_with(&[("c1", 6000, 12 * (1 << 30))], Arc::clone(&gateway));
        reconciler
            .engine
            .cache()
            .reserve(
                "t1/web",
                ResourceVector::new(2000, 4 * (1 << 30)),
                &[Placement::new("c1", 2)],
            )
            .unwrap();

        reconciler
            .reconcile(&("t1".to_string(), "web".to_string()))
            .await
            .unwrap();

        assert!(gateway.annotation("t1", "web").is_none());
        assert!(reconciler.engine.cache().placements_of("t1/web").is_none());

        // running again with the annotation already absent must not fail
        reconciler
            .reconcile(&("t1".to_string(), "web".to_string()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dirty_tenant_requeues() {
        let gateway = Arc::new(MockGateway::new());
        gateway.insert_namespace("t1", "web", BTreeMap::new());
        let reconciler = reconciler_with(&[("c1", 6000, 12 * (1 << 30))], Arc::clone(&gateway));
        reconciler.dirty.mark("vc-a/demo");

        let requeue = reconciler
            .reconcile(&("t1".to_string(), "web".to_string()))
            .await
            .unwrap();
        assert_eq!(requeue, Some(DIRTY_REQUEUE));
    }

    #[tokio::test]
    async fn test_missing_namespace_deschedules() {
        let gateway = Arc::new(MockGateway::new());
        let reconciler = reconciler_with(&[("c1", 6000, 12 * (1 << 30))], Arc::clone(&gateway));
        reconciler
            .engine
            .cache()
            .reserve(
                "t1/gone",
                ResourceVector::new(2000, 4 * (1 << 30)),
                &[Placement::new("c1", 1)],
            )
            .unwrap();

        reconciler
            .reconcile(&("t1".to_string(), "gone".to_string()))
            .await
            .unwrap();
        assert!(reconciler.engine.cache().placements_of("t1/gone").is_none());
    }

    #[tokio::test]
    async fn test_insufficient_capacity_emits_failed_event() {
        let gateway = Arc::new(MockGateway::new());
        gateway.insert_namespace("t1", "web", BTreeMap::new());
        gateway.insert_quota("t1", "web", "8", "16Gi");

        let reconciler = reconciler_with(&[("c1", 2000, 4 * (1 << 30))], Arc::clone(&gateway));
        let err = reconciler
            .reconcile(&("t1".to_string(), "web".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::InsufficientCapacity(_)));
        assert_eq!(
            gateway.events.lock().unwrap().as_slice(),
            &[("web".to_string(), "Failed".to_string())]
        );
    }

    #[tokio::test]
    async fn test_stable_placement_only_ensures() {
        let gateway = Arc::new(MockGateway::new());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            ANNOTATION_SCHEDULED_PLACEMENTS.to_string(),
            r#"{"c1":4}"#.to_string(),
        );
        gateway.insert_namespace("t1", "web", annotations);
        gateway.insert_quota("t1", "web", "8", "16Gi");

        let reconciler = reconciler_with(&[("c1", 8000, 16 * (1 << 30))], Arc::clone(&gateway));
        reconciler
            .reconcile(&("t1".to_string(), "web".to_string()))
            .await
            .unwrap();

        // annotation untouched, no event published
        assert_eq!(gateway.annotation("t1", "web").as_deref(), Some(r#"{"c1":4}"#));
        assert!(gateway.events.lock().unwrap().is_empty());
        assert_eq!(
            reconciler.engine.cache().placements_of("t1/web").unwrap(),
            vec![Placement::new("c1", 4)]
        );
    }
}
