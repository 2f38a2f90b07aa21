//! Annotation keys shared between the provisioner, the namespace scheduler
//! and the patroller.
//!
//! These keys are externally observable contract: the patroller reads them
//! back from the super cluster to decide ownership and garbage collection.

/// Name of the owning VirtualCluster, set on super cluster namespaces.
pub const ANNOTATION_VC_NAME: &str = "tenancy.x-k8s.io/vc.name";

/// Namespace of the owning VirtualCluster.
pub const ANNOTATION_VC_NAMESPACE: &str = "tenancy.x-k8s.io/vc.namespace";

/// UID of the owning VirtualCluster. A mismatch with the live object marks
/// the namespace as orphaned.
pub const ANNOTATION_VC_UID: &str = "tenancy.x-k8s.io/vc.uid";

/// "true" on the namespace hosting the tenant's control plane components.
pub const ANNOTATION_VC_ROOT_NS: &str = "tenancy.x-k8s.io/vc.rootNs";

/// UID of the tenant-side namespace a super cluster namespace projects.
pub const ANNOTATION_TENANT_NS_UID: &str = "tenancy.x-k8s.io/tenant-ns.uid";

/// JSON map `clusterName -> numSlices` on scheduled tenant namespaces.
pub const ANNOTATION_SCHEDULED_PLACEMENTS: &str = "scheduled.tenancy.x-k8s.io/placements";

/// Optional `k=v[,k=v...]` selector restricting which super clusters may
/// host a tenant namespace.
pub const ANNOTATION_CLUSTER_SELECTOR: &str = "scheduling.tenancy.x-k8s.io/cluster-selector";

/// Super cluster service cluster IP, published on tenant services for the
/// patched DNS plugin.
pub const ANNOTATION_CLUSTER_IP: &str = "transparency.tenancy.x-k8s.io/clusterIP";

/// Field manager used for server-side apply patches.
pub const FIELD_MANAGER: &str = "virtualcluster-operator";
