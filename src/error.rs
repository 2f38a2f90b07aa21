//! Error types for the VirtualCluster operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during operator operations
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Optimistic-concurrency conflict; refetch and retry
    Conflict(String),
    /// Configuration error
    Configuration(String),
    /// Reconciliation error
    Reconciliation(String),
    /// PKI generation or encoding error
    Pki(String),
    /// Serialization error
    Serialization(String),
    /// Resource not found
    NotFound(String),
    /// Referenced ClusterVersion does not exist
    ClusterVersionNotFound(String),
    /// A control plane component did not become ready in time
    ComponentTimeout(String),
    /// No combination of super clusters can host the demanded slices
    InsufficientCapacity(String),
    /// A reservation would exceed a super cluster's capacity
    OverCapacity(String),
}

impl OperatorError {
    /// Provisioning-terminal errors stop the VirtualCluster state machine;
    /// everything else is retried with backoff.
    pub fn is_provisioning_terminal(&self) -> bool {
        matches!(
            self,
            OperatorError::Pki(_)
                | OperatorError::ClusterVersionNotFound(_)
                | OperatorError::ComponentTimeout(_)
        )
    }
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Reconciliation(msg) => write!(f, "Reconciliation error: {}", msg),
            OperatorError::Pki(msg) => write!(f, "PKI error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::ClusterVersionNotFound(msg) => {
                write!(f, "ClusterVersion not found: {}", msg)
            }
            OperatorError::ComponentTimeout(msg) => {
                write!(f, "Component readiness timeout: {}", msg)
            }
            OperatorError::InsufficientCapacity(msg) => {
                write!(f, "Insufficient scheduling capacity: {}", msg)
            }
            OperatorError::OverCapacity(msg) => {
                write!(f, "Reservation over cluster capacity: {}", msg)
            }
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 409 => {
                OperatorError::Conflict(err.to_string())
            }
            _ => OperatorError::KubeApi(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(OperatorError::Pki("keygen".into()).is_provisioning_terminal());
        assert!(OperatorError::ComponentTimeout("etcd".into()).is_provisioning_terminal());
        assert!(OperatorError::ClusterVersionNotFound("cv".into()).is_provisioning_terminal());
        assert!(!OperatorError::KubeApi("conflict".into()).is_provisioning_terminal());
        assert!(!OperatorError::InsufficientCapacity("c1".into()).is_provisioning_terminal());
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            OperatorError::KubeApi("api".to_string()),
            OperatorError::Configuration("config".to_string()),
            OperatorError::Reconciliation("reconcile".to_string()),
            OperatorError::Pki("keygen".to_string()),
            OperatorError::Serialization("serde".to_string()),
            OperatorError::NotFound("resource".to_string()),
            OperatorError::ClusterVersionNotFound("cv".to_string()),
            OperatorError::ComponentTimeout("etcd".to_string()),
            OperatorError::InsufficientCapacity("4 slices".to_string()),
            OperatorError::OverCapacity("c1".to_string()),
        ];

        for err in errors {
            // Ensure Display is implemented
            let _ = format!("{}", err);
        }
    }
}
