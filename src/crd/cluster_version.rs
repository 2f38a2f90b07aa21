//! ClusterVersion Custom Resource Definition
//!
//! A ClusterVersion is an immutable template catalogue describing how one
//! version of a tenant control plane is assembled: one bundle each for etcd,
//! the API server and the controller manager, plus the resource slice used
//! by the namespace scheduler.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ClusterVersion is the Schema for the clusterversions API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tenancy.x-k8s.io",
    version = "v1alpha1",
    kind = "ClusterVersion",
    shortname = "cv",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersionSpec {
    /// Template for the etcd component
    pub etcd: ComponentBundle,

    /// Template for the API server component
    pub api_server: ComponentBundle,

    /// Template for the controller manager component
    pub controller_manager: ComponentBundle,

    /// Quantum of reservation used when scheduling tenant namespaces
    #[serde(default)]
    pub scheduling_slice: SchedulingSlice,
}

/// Workload and service descriptors for one control plane component.
///
/// The operator renders these into a StatefulSet (and optionally a Service)
/// in the tenant's root namespace; only the fields below are tenant-specific,
/// everything else is fixed by the version.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBundle {
    /// Workload and service name (also the StatefulSet's service name)
    pub name: String,

    /// Container image
    pub image: String,

    /// Number of replicas
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Container command
    #[serde(default)]
    pub command: Vec<String>,

    /// Container arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Container ports
    #[serde(default)]
    pub ports: Vec<ComponentPort>,

    /// Resource limits and requests
    #[serde(default)]
    pub resources: ComponentResources,

    /// Persistent storage, if the component needs any
    #[serde(default)]
    pub storage: Option<ComponentStorage>,

    /// Service exposing the component, if any
    #[serde(default)]
    pub service: Option<ComponentService>,
}

/// A single named container port
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentPort {
    /// Port name
    pub name: String,
    /// Port number
    pub port: i32,
}

/// Resource limits and requests for a component container
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ComponentResources {
    /// CPU request (e.g. "500m", "2")
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory request (e.g. "512Mi", "2Gi")
    #[serde(default)]
    pub memory: Option<String>,
}

/// Persistent storage for a component
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStorage {
    /// Storage class name for PVCs
    #[serde(default)]
    pub storage_class_name: Option<String>,
    /// Size of the persistent volume (e.g. "10Gi")
    pub size: String,
}

/// Service descriptor for a component
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentService {
    /// Service type (ClusterIP, NodePort)
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Port the service listens on
    #[serde(default = "default_service_port")]
    pub port: i32,
}

/// The (cpu, memory) quantum reserved per scheduled slice
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSlice {
    /// CPU per slice (e.g. "2")
    pub cpu: String,
    /// Memory per slice (e.g. "4Gi")
    pub memory: String,
}

impl Default for SchedulingSlice {
    fn default() -> Self {
        Self {
            cpu: default_slice_cpu(),
            memory: default_slice_memory(),
        }
    }
}

impl ClusterVersionSpec {
    /// True when the API server is exposed through a ClusterIP service,
    /// in which case the service must exist before the PKI is minted.
    pub fn api_server_is_cluster_ip(&self) -> bool {
        self.api_server
            .service
            .as_ref()
            .is_some_and(|s| s.service_type == "ClusterIP")
    }

    /// In-cluster DNS name of the API server service within `root_ns`.
    pub fn api_server_domain(&self, root_ns: &str) -> String {
        format!("{}.{}.svc", self.api_server.name, root_ns)
    }

    /// DNS names the etcd serving certificate must cover: the client
    /// service plus every per-replica pod domain.
    pub fn etcd_domains(&self, root_ns: &str) -> Vec<String> {
        let sts = &self.etcd.name;
        let svc = format!("{}.{}.svc", sts, root_ns);
        let mut domains = vec![svc.clone()];
        for i in 0..self.etcd.replicas {
            domains.push(format!("{}-{}.{}", sts, i, svc));
        }
        domains
    }
}

// Default value functions
fn default_replicas() -> i32 {
    1
}

fn default_service_type() -> String {
    "ClusterIP".to_string()
}

fn default_service_port() -> i32 {
    6443
}

fn default_slice_cpu() -> String {
    "1".to_string()
}

fn default_slice_memory() -> String {
    "2Gi".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(name: &str) -> ComponentBundle {
        ComponentBundle {
            name: name.to_string(),
            image: format!("registry.k8s.io/{}:latest", name),
            replicas: 1,
            command: Vec::new(),
            args: Vec::new(),
            ports: Vec::new(),
            resources: ComponentResources::default(),
            storage: None,
            service: None,
        }
    }

    fn spec() -> ClusterVersionSpec {
        ClusterVersionSpec {
            etcd: ComponentBundle {
                replicas: 3,
                ..bundle("etcd")
            },
            api_server: ComponentBundle {
                service: Some(ComponentService {
                    service_type: "ClusterIP".to_string(),
                    port: 6443,
                }),
                ..bundle("apiserver")
            },
            controller_manager: bundle("controller-manager"),
            scheduling_slice: SchedulingSlice::default(),
        }
    }

    #[test]
    fn test_api_server_is_cluster_ip() {
        let mut spec = spec();
        assert!(spec.api_server_is_cluster_ip());

        spec.api_server.service.as_mut().unwrap().service_type = "NodePort".to_string();
        assert!(!spec.api_server_is_cluster_ip());

        spec.api_server.service = None;
        assert!(!spec.api_server_is_cluster_ip());
    }

    #[test]
    fn test_api_server_domain() {
        assert_eq!(
            spec().api_server_domain("vc-a-6a2d1c-demo"),
            "apiserver.vc-a-6a2d1c-demo.svc"
        );
    }

    #[test]
    fn test_etcd_domains_cover_all_replicas() {
        let domains = spec().etcd_domains("tenant1");
        assert_eq!(
            domains,
            vec![
                "etcd.tenant1.svc",
                "etcd-0.etcd.tenant1.svc",
                "etcd-1.etcd.tenant1.svc",
                "etcd-2.etcd.tenant1.svc",
            ]
        );
    }

    #[test]
    fn test_slice_defaults() {
        let slice = SchedulingSlice::default();
        assert_eq!(slice.cpu, "1");
        assert_eq!(slice.memory, "2Gi");
    }
}
