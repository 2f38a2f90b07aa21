//! Controllers for the VirtualCluster operator
//!
//! The provisioner drives VirtualCluster objects through their lifecycle on
//! the kube runtime; the namespace reconciler and the patroller run as
//! leader-owned worker loops over the tenant control planes.

pub mod namespace;
pub mod patrol;
mod provisioner;
mod registry;

pub use namespace::{CrdSliceResolver, NamespaceReconciler, ReconcileKey, SliceResolver};
pub use patrol::{PatrolMetrics, Patroller};
pub use provisioner::{gen_initial_cluster_args, ControlPlaneComponent, ProvisionerController};
pub use registry::TenantRegistrar;

use crate::error::OperatorError;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Exponential backoff error policy for controller reconciliation failures.
/// Categorizes errors by severity to choose appropriate retry delays.
pub(crate) fn error_policy_backoff<K>(
    _object: std::sync::Arc<K>,
    error: &OperatorError,
    _ctx: std::sync::Arc<impl std::any::Any + Send + Sync>,
) -> Action {
    let delay_secs = match error {
        // Conflicts resolve on the next observation
        OperatorError::Conflict(_) => 5,
        // Transient K8s API errors — retry quickly
        OperatorError::KubeApi(_) => 10,
        // Resource not yet available — moderate wait
        OperatorError::NotFound(_) | OperatorError::ClusterVersionNotFound(_) => 15,
        // Reconciliation issues — longer wait
        OperatorError::Reconciliation(_) | OperatorError::ComponentTimeout(_) => 30,
        // Capacity may be freed by other tenants, keep trying slowly
        OperatorError::InsufficientCapacity(_) | OperatorError::OverCapacity(_) => 60,
        // Config/serialization/PKI errors unlikely to self-heal — back off further
        OperatorError::Configuration(_)
        | OperatorError::Serialization(_)
        | OperatorError::Pki(_) => 60,
    };

    Action::requeue(Duration::from_secs(delay_secs))
}
