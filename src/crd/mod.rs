//! Custom Resource Definitions for the VirtualCluster operator
//!
//! - `VirtualCluster`: declares one tenant control plane
//! - `ClusterVersion`: immutable template catalogue for a control plane version

mod cluster_version;
mod virtual_cluster;

pub use cluster_version::{
    ClusterVersion, ClusterVersionSpec, ComponentBundle, ComponentPort, ComponentResources,
    ComponentService, ComponentStorage, SchedulingSlice,
};
pub use virtual_cluster::{
    VirtualCluster, VirtualClusterCondition, VirtualClusterPhase, VirtualClusterSpec,
    VirtualClusterStatus,
};
