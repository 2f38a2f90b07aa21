//! Tenant control plane provisioner.
//!
//! Watches VirtualCluster objects and drives each one through
//! Pending → Provisioning → Ready. Ordering inside provisioning is fixed:
//! the API server service must exist before the PKI is minted (its cluster
//! IP lands in the serving certificate), and the PKI must exist before any
//! component that mounts it.

use crate::conditions::{
    build_condition, set_condition, CONDITION_FALSE, CONDITION_TRUE, VC_CONDITION_PKI_READY,
    VC_CONDITION_PROVISIONED, VC_CONDITION_READY, VC_FINALIZER,
};
use crate::constants::{
    ANNOTATION_CLUSTER_IP, ANNOTATION_VC_NAME, ANNOTATION_VC_NAMESPACE, ANNOTATION_VC_ROOT_NS,
    ANNOTATION_VC_UID,
};
use crate::controllers::error_policy_backoff;
use crate::crd::{
    ClusterVersion, ComponentBundle, VirtualCluster, VirtualClusterPhase, VirtualClusterStatus,
};
use crate::error::{OperatorError, Result};
use crate::pki;
use crate::secret::{self, is_already_exists};
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service, ServicePort, ServiceSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default etcd peer port used in `--initial-cluster`.
const ETCD_PEER_PORT: i32 = 2380;
/// Cadence of component readiness polls.
const COMPONENT_POLL_PERIOD: Duration = Duration::from_secs(2);
/// How long to wait for a ClusterIP allocation before degrading to DNS-only.
const CLUSTER_IP_WAIT: Duration = Duration::from_secs(30);

/// The finite set of tenant control plane components. Unknown component
/// names are a programmer error, not a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPlaneComponent {
    Etcd,
    ApiServer,
    ControllerManager,
}

impl ControlPlaneComponent {
    pub fn name(&self) -> &'static str {
        match self {
            ControlPlaneComponent::Etcd => "etcd",
            ControlPlaneComponent::ApiServer => "apiserver",
            ControlPlaneComponent::ControllerManager => "controller-manager",
        }
    }

    pub fn bundle<'a>(&self, cv: &'a ClusterVersion) -> &'a ComponentBundle {
        match self {
            ControlPlaneComponent::Etcd => &cv.spec.etcd,
            ControlPlaneComponent::ApiServer => &cv.spec.api_server,
            ControlPlaneComponent::ControllerManager => &cv.spec.controller_manager,
        }
    }
}

/// Values for etcd's `--initial-cluster` flag: every peer in index order,
/// comma separated, no trailing comma.
pub fn gen_initial_cluster_args(replicas: i32, sts_name: &str, svc_name: &str) -> String {
    let mut peers = Vec::with_capacity(replicas.max(0) as usize);
    for i in 0..replicas {
        peers.push(format!(
            "{sts}-{i}=https://{sts}-{i}.{svc}:{port}",
            sts = sts_name,
            svc = svc_name,
            port = ETCD_PEER_PORT
        ));
    }
    peers.join(",")
}

pub struct ProvisionerController {
    client: Client,
    provisioner_timeout: Duration,
}

impl ProvisionerController {
    pub fn new(client: Client, provisioner_timeout: Duration) -> Self {
        Self {
            client,
            provisioner_timeout,
        }
    }

    /// Run the VirtualCluster controller until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let vcs: Api<VirtualCluster> = Api::all(self.client.clone());

        info!("Starting VirtualCluster provisioner");

        Controller::new(vcs, Config::default())
            .shutdown_on_signal()
            .run(
                |vc, ctx| async move { ctx.reconcile(vc).await },
                |_vc, error, _ctx| error_policy_backoff(_vc, error, _ctx),
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        info!("Reconciled VirtualCluster: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(
        &self,
        vc: Arc<VirtualCluster>,
    ) -> std::result::Result<Action, OperatorError> {
        let name = vc.name_any();
        let namespace = vc.namespace().unwrap_or_else(|| "default".to_string());

        info!("Reconciling VirtualCluster {}/{}", namespace, name);

        if vc.metadata.deletion_timestamp.is_some() {
            return self.handle_deletion(&vc, &namespace).await;
        }

        self.ensure_finalizer(&vc, &namespace).await?;

        let phase = vc
            .status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default();

        match phase {
            VirtualClusterPhase::Ready => {
                // level-triggered: re-verify component readiness periodically
                Ok(Action::requeue(Duration::from_secs(60)))
            }
            VirtualClusterPhase::Failed => {
                // terminal; only deletion moves the object from here
                Ok(Action::await_change())
            }
            _ => match self.provision(&vc, &namespace).await {
                Ok(()) => Ok(Action::requeue(Duration::from_secs(60))),
                Err(e) if e.is_provisioning_terminal() => {
                    error!(
                        "Provisioning VirtualCluster {}/{} failed terminally: {}",
                        namespace, name, e
                    );
                    self.update_status(
                        &vc,
                        &namespace,
                        VirtualClusterPhase::Failed,
                        Some(e.to_string()),
                    )
                    .await?;
                    Ok(Action::await_change())
                }
                Err(e) => Err(e),
            },
        }
    }

    /// The fixed provisioning sequence.
    async fn provision(&self, vc: &VirtualCluster, namespace: &str) -> Result<()> {
        let cv = self.fetch_cluster_version(vc).await?;
        let root_ns = vc.root_namespace();

        self.update_status(vc, namespace, VirtualClusterPhase::Provisioning, None)
            .await?;

        // 1. root namespace
        self.create_root_namespace(vc, &root_ns).await?;

        // 2. ClusterIP API server service goes first so its address can be
        //    embedded into the serving certificate
        let is_cluster_ip = cv.spec.api_server_is_cluster_ip();
        let mut cluster_ip = None;
        if is_cluster_ip {
            let bundle = &cv.spec.api_server;
            info!(component = %bundle.name, "Deploying ClusterIP service ahead of PKI");
            self.create_service(vc, &root_ns, bundle).await?;
            cluster_ip = self.await_cluster_ip(&root_ns, &bundle.name).await;
            if cluster_ip.is_none() {
                warn!(
                    service = %bundle.name,
                    namespace = root_ns,
                    "No cluster IP allocated in time; API server certificate will carry DNS SANs only"
                );
            }
        }

        // 3. PKI
        let ca_group = pki::mint(vc, &cv, cluster_ip.as_deref())?;
        self.set_pki_condition(vc, namespace).await?;

        // 4. secrets
        secret::persist_pki_secrets(self.client.clone(), &root_ns, &ca_group).await?;

        // 5.-7. components, in order, each awaited to readiness
        for component in [
            ControlPlaneComponent::Etcd,
            ControlPlaneComponent::ApiServer,
            ControlPlaneComponent::ControllerManager,
        ] {
            self.deploy_component(vc, &cv, &root_ns, component, is_cluster_ip)
                .await?;
        }

        // 8. Ready
        self.update_status(vc, namespace, VirtualClusterPhase::Ready, None)
            .await?;
        info!(
            "VirtualCluster {}/{} is ready in root namespace {}",
            namespace,
            vc.name_any(),
            root_ns
        );
        Ok(())
    }

    async fn fetch_cluster_version(&self, vc: &VirtualCluster) -> Result<ClusterVersion> {
        let cvs: Api<ClusterVersion> = Api::all(self.client.clone());
        let name = &vc.spec.cluster_version_name;
        cvs.get(name)
            .await
            .map_err(|_| OperatorError::ClusterVersionNotFound(name.clone()))
    }

    /// Create the tenant root namespace carrying the ownership annotations.
    async fn create_root_namespace(&self, vc: &VirtualCluster, root_ns: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_VC_NAME.to_string(), vc.name_any());
        annotations.insert(
            ANNOTATION_VC_NAMESPACE.to_string(),
            vc.namespace().unwrap_or_default(),
        );
        annotations.insert(
            ANNOTATION_VC_UID.to_string(),
            vc.metadata.uid.clone().unwrap_or_default(),
        );
        annotations.insert(ANNOTATION_VC_ROOT_NS.to_string(), "true".to_string());

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(root_ns.to_string()),
                labels: Some(self.common_labels(vc)),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => info!(namespace = root_ns, "Created root namespace"),
            Err(e) if is_already_exists(&e) => {
                info!(namespace = root_ns, "Root namespace already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Poll the API server service until a cluster IP is allocated or the
    /// short deadline expires.
    async fn await_cluster_ip(&self, root_ns: &str, svc_name: &str) -> Option<String> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), root_ns);
        let deadline = tokio::time::Instant::now() + CLUSTER_IP_WAIT;

        while tokio::time::Instant::now() < deadline {
            match services.get(svc_name).await {
                Ok(svc) => {
                    let ip = svc
                        .spec
                        .as_ref()
                        .and_then(|s| s.cluster_ip.clone())
                        .filter(|ip| !ip.is_empty() && ip != "None");
                    if let Some(ip) = ip {
                        // record the address for the DNS plugin
                        let patch = serde_json::json!({
                            "metadata": { "annotations": { ANNOTATION_CLUSTER_IP: ip } }
                        });
                        if let Err(e) = services
                            .patch(svc_name, &PatchParams::default(), &Patch::Merge(&patch))
                            .await
                        {
                            warn!(service = svc_name, "Failed to annotate cluster IP: {}", e);
                        }
                        return Some(ip);
                    }
                }
                Err(e) => {
                    warn!(service = svc_name, "Cluster IP lookup failed: {}", e);
                }
            }
            tokio::time::sleep(COMPONENT_POLL_PERIOD).await;
        }
        None
    }

    /// Materialise one component bundle: StatefulSet, then service (unless
    /// the ClusterIP API server service already exists), then readiness.
    async fn deploy_component(
        &self,
        vc: &VirtualCluster,
        cv: &ClusterVersion,
        root_ns: &str,
        component: ControlPlaneComponent,
        api_service_created_early: bool,
    ) -> Result<()> {
        let bundle = component.bundle(cv);
        info!(component = component.name(), namespace = root_ns, "Deploying component");

        let statefulset = self.render_statefulset(vc, root_ns, component, bundle);
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), root_ns);
        match statefulsets.create(&PostParams::default(), &statefulset).await {
            Ok(_) => {}
            Err(e) if is_already_exists(&e) => {
                info!(
                    statefulset = %bundle.name,
                    namespace = root_ns,
                    "StatefulSet already exists"
                );
            }
            Err(e) => return Err(e.into()),
        }

        let skip_service = component == ControlPlaneComponent::ApiServer && api_service_created_early;
        if bundle.service.is_some() && !skip_service {
            self.create_service(vc, root_ns, bundle).await?;
        }

        self.wait_component_ready(root_ns, &bundle.name, bundle.replicas)
            .await
    }

    async fn create_service(
        &self,
        vc: &VirtualCluster,
        root_ns: &str,
        bundle: &ComponentBundle,
    ) -> Result<()> {
        let Some(desc) = &bundle.service else {
            return Ok(());
        };
        let services: Api<Service> = Api::namespaced(self.client.clone(), root_ns);

        let service = Service {
            metadata: ObjectMeta {
                name: Some(bundle.name.clone()),
                namespace: Some(root_ns.to_string()),
                labels: Some(self.common_labels(vc)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(desc.service_type.clone()),
                selector: Some(self.pod_selector(&bundle.name)),
                ports: Some(vec![ServicePort {
                    name: Some(bundle.name.clone()),
                    port: desc.port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match services.create(&PostParams::default(), &service).await {
            Ok(_) => info!(service = %bundle.name, namespace = root_ns, "Created service"),
            Err(e) if is_already_exists(&e) => {
                info!(service = %bundle.name, namespace = root_ns, "Service already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Render the StatefulSet for a component bundle in the root namespace.
    fn render_statefulset(
        &self,
        vc: &VirtualCluster,
        root_ns: &str,
        component: ControlPlaneComponent,
        bundle: &ComponentBundle,
    ) -> StatefulSet {
        let selector = self.pod_selector(&bundle.name);

        let mut args = bundle.args.clone();
        if component == ControlPlaneComponent::Etcd {
            args.push(format!(
                "--initial-cluster={}",
                gen_initial_cluster_args(bundle.replicas, &bundle.name, &bundle.name)
            ));
        }

        let mut requests = BTreeMap::new();
        if let Some(cpu) = &bundle.resources.cpu {
            requests.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &bundle.resources.memory {
            requests.insert("memory".to_string(), Quantity(memory.clone()));
        }

        let container = Container {
            name: bundle.name.clone(),
            image: Some(bundle.image.clone()),
            command: if bundle.command.is_empty() {
                None
            } else {
                Some(bundle.command.clone())
            },
            args: if args.is_empty() { None } else { Some(args) },
            ports: Some(
                bundle
                    .ports
                    .iter()
                    .map(|p| ContainerPort {
                        name: Some(p.name.clone()),
                        container_port: p.port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: if requests.is_empty() {
                None
            } else {
                Some(ResourceRequirements {
                    requests: Some(requests),
                    ..Default::default()
                })
            },
            ..Default::default()
        };

        let volume_claim_templates = bundle.storage.as_ref().map(|storage| {
            vec![PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some("data".to_string()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: storage.storage_class_name.clone(),
                    resources: Some(VolumeResourceRequirements {
                        requests: Some({
                            let mut reqs = BTreeMap::new();
                            reqs.insert("storage".to_string(), Quantity(storage.size.clone()));
                            reqs
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        });

        StatefulSet {
            metadata: ObjectMeta {
                name: Some(bundle.name.clone()),
                namespace: Some(root_ns.to_string()),
                labels: Some(self.common_labels(vc)),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(bundle.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                service_name: bundle.name.clone(),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                volume_claim_templates,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Poll the StatefulSet until all replicas are ready or the provisioner
    /// timeout expires.
    async fn wait_component_ready(&self, root_ns: &str, name: &str, replicas: i32) -> Result<()> {
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), root_ns);
        let deadline = tokio::time::Instant::now() + self.provisioner_timeout;

        loop {
            match statefulsets.get(name).await {
                Ok(sts) => {
                    let ready = sts
                        .status
                        .as_ref()
                        .and_then(|s| s.ready_replicas)
                        .unwrap_or(0);
                    if ready == replicas {
                        info!(component = name, namespace = root_ns, "Component is ready");
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(component = name, "Readiness poll failed: {}", e);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OperatorError::ComponentTimeout(format!(
                    "{}/{} did not reach {} ready replica(s)",
                    root_ns, name, replicas
                )));
            }
            tokio::time::sleep(COMPONENT_POLL_PERIOD).await;
        }
    }

    async fn ensure_finalizer(&self, vc: &VirtualCluster, namespace: &str) -> Result<()> {
        let finalizers = vc.metadata.finalizers.as_deref().unwrap_or_default();
        if finalizers.contains(&VC_FINALIZER.to_string()) {
            return Ok(());
        }

        let vcs: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": [VC_FINALIZER]
            }
        });
        vcs.patch(
            &vc.name_any(),
            &PatchParams::apply(crate::constants::FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await?;

        Ok(())
    }

    /// Deletion drains the finalizer: the root namespace is removed (which
    /// cascades to every component object inside it), then the finalizer.
    async fn handle_deletion(
        &self,
        vc: &VirtualCluster,
        namespace: &str,
    ) -> std::result::Result<Action, OperatorError> {
        let name = vc.name_any();
        let root_ns = vc.root_namespace();
        info!("Handling deletion of VirtualCluster {}/{}", namespace, name);

        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(&root_ns, &DeleteParams::default()).await {
            Ok(_) => info!(namespace = root_ns, "Deleted root namespace"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        let vcs: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);
        let finalizers: Vec<String> = vc
            .metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter(|f| f.as_str() != VC_FINALIZER)
            .cloned()
            .collect();

        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        vcs.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!("Finalizer removed for VirtualCluster {}/{}", namespace, name);
        Ok(Action::await_change())
    }

    async fn set_pki_condition(&self, vc: &VirtualCluster, namespace: &str) -> Result<()> {
        let vcs: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);
        let mut conditions = vc
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();
        set_condition(
            &mut conditions,
            build_condition(
                VC_CONDITION_PKI_READY,
                CONDITION_TRUE,
                "PkiMinted",
                "Root CA, component certificates and kubeconfigs are minted",
            ),
        );
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        vcs.patch_status(&vc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn update_status(
        &self,
        vc: &VirtualCluster,
        namespace: &str,
        phase: VirtualClusterPhase,
        reason: Option<String>,
    ) -> Result<()> {
        let vcs: Api<VirtualCluster> = Api::namespaced(self.client.clone(), namespace);

        let mut conditions = vc
            .status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default();

        let (ready_status, ready_reason, ready_msg) = match phase {
            VirtualClusterPhase::Ready => (
                CONDITION_TRUE,
                "AllComponentsReady",
                "etcd, apiserver and controller-manager are ready".to_string(),
            ),
            VirtualClusterPhase::Failed => (
                CONDITION_FALSE,
                "ProvisioningFailed",
                reason.clone().unwrap_or_default(),
            ),
            _ => (
                CONDITION_FALSE,
                "Provisioning",
                "Control plane components are being materialised".to_string(),
            ),
        };
        set_condition(
            &mut conditions,
            build_condition(VC_CONDITION_READY, ready_status, ready_reason, &ready_msg),
        );

        if phase == VirtualClusterPhase::Ready {
            set_condition(
                &mut conditions,
                build_condition(
                    VC_CONDITION_PROVISIONED,
                    CONDITION_TRUE,
                    "ComponentsDeployed",
                    "All control plane objects exist in the root namespace",
                ),
            );
        }

        let status = VirtualClusterStatus {
            phase,
            cluster_namespace: Some(vc.root_namespace()),
            conditions,
            reason,
            observed_generation: vc.metadata.generation,
            last_updated: Some(Utc::now().to_rfc3339()),
        };

        let patch = serde_json::json!({ "status": status });
        vcs.patch_status(&vc.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    fn common_labels(&self, vc: &VirtualCluster) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            "virtualcluster".to_string(),
        );
        labels.insert("app.kubernetes.io/instance".to_string(), vc.name_any());
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "virtualcluster-operator".to_string(),
        );
        for (k, v) in &vc.spec.extra_labels {
            labels.insert(k.clone(), v.clone());
        }
        labels
    }

    fn pod_selector(&self, component: &str) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            "virtualcluster".to_string(),
        );
        labels.insert("app.kubernetes.io/component".to_string(), component.to_string());
        labels
    }
}
