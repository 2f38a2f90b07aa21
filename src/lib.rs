//! VirtualCluster Operator
//!
//! Provisions nested tenant control planes on a host Kubernetes cluster and
//! schedules tenant namespaces onto super clusters.
//!
//! ## Custom Resources
//!
//! - `VirtualCluster`: declares one tenant control plane (etcd + API server
//!   + controller manager) to be materialised in a reserved root namespace
//! - `ClusterVersion`: immutable template catalogue for one control plane
//!   version, including the scheduling slice
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: tenancy.x-k8s.io/v1alpha1
//! kind: VirtualCluster
//! metadata:
//!   name: demo
//!   namespace: vc-a
//! spec:
//!   clusterVersionName: v1.22
//! ```

pub mod conditions;
pub mod constants;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod kubeconfig;
pub mod leader_election;
pub mod pki;
pub mod quota;
pub mod scheduler;
pub mod secret;
pub mod tenant;
pub mod workqueue;

pub use controllers::{
    NamespaceReconciler, Patroller, ProvisionerController, TenantRegistrar,
};
pub use crd::{
    ClusterVersion, ClusterVersionSpec, ComponentBundle, SchedulingSlice, VirtualCluster,
    VirtualClusterPhase, VirtualClusterSpec, VirtualClusterStatus,
};
pub use error::{OperatorError, Result};
pub use scheduler::{NamespaceCandidate, ScheduleResult, SchedulerEngine};
