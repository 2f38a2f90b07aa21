//! Kubernetes-standard status condition helpers
//!
//! Provides constants and builder functions for managing status conditions
//! on VirtualCluster objects following the Kubernetes API conventions.

use chrono::Utc;

use crate::crd::VirtualClusterCondition;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// VirtualCluster condition types
pub const VC_CONDITION_READY: &str = "Ready";
pub const VC_CONDITION_PROVISIONED: &str = "Provisioned";
pub const VC_CONDITION_PKI_READY: &str = "PkiReady";

// Finalizer names
pub const VC_FINALIZER: &str = "tenancy.x-k8s.io/vc-cleanup";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> VirtualClusterCondition {
    VirtualClusterCondition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when
/// the status hasn't changed.
pub fn set_condition(conditions: &mut Vec<VirtualClusterCondition>, new: VirtualClusterCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}
