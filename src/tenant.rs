//! Access to tenant API servers.
//!
//! The namespace reconciler and the patroller talk to tenants through the
//! [`TenantGateway`] trait so the scheduling logic stays independent of the
//! connection plumbing. The live implementation builds one `kube::Client`
//! per tenant from the admin kubeconfig the provisioner persisted.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Namespace, ObjectReference, ResourceQuota};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::{OperatorError, Result};
use crate::secret::{self, ADMIN_SECRET_NAME};

/// Back-reference to the VirtualCluster owning a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantOwner {
    pub vc_namespace: String,
    pub vc_name: String,
    pub vc_uid: String,
}

impl TenantOwner {
    /// `<vc namespace>/<vc name>`, the dirty-set key.
    pub fn vc_key(&self) -> String {
        format!("{}/{}", self.vc_namespace, self.vc_name)
    }
}

/// Operations the scheduler needs against tenant control planes. Keys are
/// cluster keys, i.e. tenant root namespaces.
#[async_trait]
pub trait TenantGateway: Send + Sync {
    /// Cluster keys of every connected tenant.
    async fn cluster_keys(&self) -> Vec<String>;

    /// Owning VirtualCluster of a tenant.
    async fn owner_info(&self, cluster_key: &str) -> Result<TenantOwner>;

    /// Fetch one namespace from the tenant API server.
    async fn get_namespace(&self, cluster_key: &str, name: &str) -> Result<Option<Namespace>>;

    /// List all namespaces of the tenant.
    async fn list_namespaces(&self, cluster_key: &str) -> Result<Vec<Namespace>>;

    /// List resource quotas inside one tenant namespace.
    async fn list_resource_quotas(
        &self,
        cluster_key: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceQuota>>;

    /// Replace a namespace object with optimistic concurrency; a stale
    /// resourceVersion surfaces as [`OperatorError::Conflict`].
    async fn update_namespace(&self, cluster_key: &str, namespace: &Namespace) -> Result<Namespace>;

    /// Record an event on a tenant namespace.
    async fn publish_event(
        &self,
        cluster_key: &str,
        ns_name: &str,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}

struct TenantHandle {
    owner: TenantOwner,
    client: Client,
}

/// Live gateway backed by per-tenant `kube::Client`s.
#[derive(Default)]
pub struct KubeTenantGateway {
    tenants: RwLock<HashMap<String, TenantHandle>>,
}

impl KubeTenantGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a tenant from the admin kubeconfig stored in its root
    /// namespace on the host cluster.
    pub async fn register_from_secret(
        &self,
        host: Client,
        cluster_key: &str,
        owner: TenantOwner,
    ) -> Result<()> {
        let secrets: Api<k8s_openapi::api::core::v1::Secret> =
            Api::namespaced(host, cluster_key);
        let admin = secrets.get(ADMIN_SECRET_NAME).await?;
        let raw = admin
            .string_data
            .as_ref()
            .and_then(|d| d.get(ADMIN_SECRET_NAME).cloned())
            .or_else(|| {
                admin.data.as_ref().and_then(|d| {
                    d.get(ADMIN_SECRET_NAME)
                        .map(|b| String::from_utf8_lossy(&b.0).into_owned())
                })
            })
            .ok_or_else(|| {
                OperatorError::NotFound(format!(
                    "secret {}/{} has no kubeconfig payload",
                    cluster_key, ADMIN_SECRET_NAME
                ))
            })?;

        let kubeconfig: Kubeconfig = serde_yaml::from_str(&raw).map_err(|e| {
            OperatorError::Configuration(format!("tenant kubeconfig parse failed: {e}"))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                OperatorError::Configuration(format!("tenant kubeconfig invalid: {e}"))
            })?;
        let client = Client::try_from(config)
            .map_err(|e| OperatorError::Configuration(format!("tenant client build failed: {e}")))?;

        info!(cluster = %cluster_key, vc = %owner.vc_key(), "Connected tenant control plane");
        self.tenants
            .write()
            .await
            .insert(cluster_key.to_string(), TenantHandle { owner, client });
        Ok(())
    }

    /// Drop a tenant connection; safe to call for unknown keys.
    pub async fn deregister(&self, cluster_key: &str) {
        if self.tenants.write().await.remove(cluster_key).is_some() {
            info!(cluster = %cluster_key, "Disconnected tenant control plane");
        }
    }

    async fn client_of(&self, cluster_key: &str) -> Result<Client> {
        let tenants = self.tenants.read().await;
        tenants
            .get(cluster_key)
            .map(|h| h.client.clone())
            .ok_or_else(|| OperatorError::NotFound(format!("unknown tenant {}", cluster_key)))
    }
}

#[async_trait]
impl TenantGateway for KubeTenantGateway {
    async fn cluster_keys(&self) -> Vec<String> {
        self.tenants.read().await.keys().cloned().collect()
    }

    async fn owner_info(&self, cluster_key: &str) -> Result<TenantOwner> {
        let tenants = self.tenants.read().await;
        tenants
            .get(cluster_key)
            .map(|h| h.owner.clone())
            .ok_or_else(|| OperatorError::NotFound(format!("unknown tenant {}", cluster_key)))
    }

    async fn get_namespace(&self, cluster_key: &str, name: &str) -> Result<Option<Namespace>> {
        let client = self.client_of(cluster_key).await?;
        let namespaces: Api<Namespace> = Api::all(client);
        Ok(namespaces.get_opt(name).await?)
    }

    async fn list_namespaces(&self, cluster_key: &str) -> Result<Vec<Namespace>> {
        let client = self.client_of(cluster_key).await?;
        let namespaces: Api<Namespace> = Api::all(client);
        Ok(namespaces.list(&ListParams::default()).await?.items)
    }

    async fn list_resource_quotas(
        &self,
        cluster_key: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceQuota>> {
        let client = self.client_of(cluster_key).await?;
        let quotas: Api<ResourceQuota> = Api::namespaced(client, namespace);
        Ok(quotas.list(&ListParams::default()).await?.items)
    }

    async fn update_namespace(&self, cluster_key: &str, namespace: &Namespace) -> Result<Namespace> {
        let client = self.client_of(cluster_key).await?;
        let namespaces: Api<Namespace> = Api::all(client);
        let name = namespace.metadata.name.clone().unwrap_or_default();
        Ok(namespaces
            .replace(&name, &PostParams::default(), namespace)
            .await?)
    }

    async fn publish_event(
        &self,
        cluster_key: &str,
        ns_name: &str,
        event_type: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let client = self.client_of(cluster_key).await?;
        let events: Api<Event> = Api::namespaced(client, ns_name);
        let now = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{}.{:08x}", ns_name, rand::random::<u32>())),
                namespace: Some(ns_name.to_string()),
                ..Default::default()
            },
            involved_object: ObjectReference {
                kind: Some("Namespace".to_string()),
                name: Some(ns_name.to_string()),
                namespace: Some(ns_name.to_string()),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            source: Some(k8s_openapi::api::core::v1::EventSource {
                component: Some("virtualcluster-scheduler".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        match events.create(&PostParams::default(), &event).await {
            Ok(_) => Ok(()),
            Err(e) if secret::is_already_exists(&e) => Ok(()),
            Err(e) => {
                warn!(cluster = %cluster_key, namespace = %ns_name, "Failed to publish event: {}", e);
                Err(e.into())
            }
        }
    }
}
