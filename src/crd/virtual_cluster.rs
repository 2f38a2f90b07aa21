//! VirtualCluster Custom Resource Definition
//!
//! A VirtualCluster declares one tenant control plane to be provisioned
//! inside the super cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VirtualCluster is the Schema for the virtualclusters API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tenancy.x-k8s.io",
    version = "v1alpha1",
    kind = "VirtualCluster",
    namespaced,
    status = "VirtualClusterStatus",
    shortname = "vc",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.clusterVersionName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterSpec {
    /// Name of the ClusterVersion holding the control plane templates
    pub cluster_version_name: String,

    /// Opaque label pairs forwarded to every object the operator creates
    /// for this tenant
    #[serde(default)]
    pub extra_labels: std::collections::BTreeMap<String, String>,
}

/// Status of the VirtualCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: VirtualClusterPhase,
    /// Super cluster namespace hosting the tenant control plane
    #[serde(default)]
    pub cluster_namespace: Option<String>,
    /// Conditions representing provisioning state
    #[serde(default)]
    pub conditions: Vec<VirtualClusterCondition>,
    /// Human-readable provisioning failure, if any
    #[serde(default)]
    pub reason: Option<String>,
    /// Last observed generation
    #[serde(default)]
    pub observed_generation: Option<i64>,
    /// Last update timestamp
    #[serde(default)]
    pub last_updated: Option<String>,
}

/// Phase of the tenant control plane lifecycle
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum VirtualClusterPhase {
    /// Declaration observed, provisioning not started
    #[default]
    Pending,
    /// Control plane components are being materialised
    Provisioning,
    /// All components report ready
    Ready,
    /// A terminal provisioning error occurred
    Failed,
    /// Deletion timestamp set, finalizer draining
    Deleting,
}

/// Condition of the VirtualCluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualClusterCondition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last time the condition transitioned
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl VirtualCluster {
    /// Super cluster namespace reserved for this tenant's control plane.
    ///
    /// The UID prefix keeps root namespaces distinct when a VirtualCluster is
    /// deleted and re-created under the same name.
    pub fn root_namespace(&self) -> String {
        let namespace = self.metadata.namespace.as_deref().unwrap_or("default");
        let name = self.metadata.name.as_deref().unwrap_or_default();
        let uid = self.metadata.uid.as_deref().unwrap_or_default();
        let uid_prefix: String = uid.chars().filter(|c| *c != '-').take(6).collect();
        format!("{}-{}-{}", namespace, uid_prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn vc(namespace: &str, name: &str, uid: &str) -> VirtualCluster {
        VirtualCluster {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: VirtualClusterSpec {
                cluster_version_name: "v1".to_string(),
                extra_labels: Default::default(),
            },
            status: None,
        }
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(VirtualClusterPhase::default(), VirtualClusterPhase::Pending);
    }

    #[test]
    fn test_root_namespace_derivation() {
        let vc = vc("vc-a", "demo", "6a2d1c4e-9f30-4bfa-8d5c-0123456789ab");
        assert_eq!(vc.root_namespace(), "vc-a-6a2d1c-demo");
    }

    #[test]
    fn test_root_namespace_differs_per_uid() {
        let first = vc("vc-a", "demo", "aaaaaaaa-0000-0000-0000-000000000000");
        let second = vc("vc-a", "demo", "bbbbbbbb-0000-0000-0000-000000000000");
        assert_ne!(first.root_namespace(), second.root_namespace());
    }

    #[test]
    fn test_spec_deserialization() {
        let spec: VirtualClusterSpec =
            serde_json::from_str(r#"{"clusterVersionName":"cv-1.22"}"#).unwrap();
        assert_eq!(spec.cluster_version_name, "cv-1.22");
        assert!(spec.extra_labels.is_empty());
    }
}
