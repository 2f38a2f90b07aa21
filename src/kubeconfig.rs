//! Kubeconfig rendering for tenant control planes.
//!
//! A kubeconfig bundles the tenant root CA, a client certificate minted for
//! the named user, and the API server address. The serialized form is the
//! standard `clientcmd` v1 YAML layout.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::pki::{self, CrtKeyPair};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEndpoint {
    pub server: String,
    #[serde(rename = "certificate-authority-data")]
    pub certificate_authority_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserCredentials,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredentials {
    #[serde(rename = "client-certificate-data")]
    pub client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    pub client_key_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextBinding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBinding {
    pub cluster: String,
    pub user: String,
}

/// Render a kubeconfig for `user` against the tenant API server.
///
/// `address` is the service cluster IP when known, else the API server DNS
/// name. `groups` become organizations on the minted client certificate.
pub fn generate_kubeconfig(
    user: &str,
    cluster_name: &str,
    address: &str,
    port: i32,
    groups: &[String],
    root_ca: &CrtKeyPair,
) -> Result<String> {
    let client = pki::new_client_cert(root_ca, user, groups)?;
    let context_name = format!("{}@{}", user, cluster_name);

    let config = Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: cluster_name.to_string(),
            cluster: ClusterEndpoint {
                server: format!("https://{}:{}", address, port),
                certificate_authority_data: STANDARD.encode(root_ca.cert_pem.as_bytes()),
            },
        }],
        users: vec![NamedUser {
            name: user.to_string(),
            user: UserCredentials {
                client_certificate_data: STANDARD.encode(client.cert_pem.as_bytes()),
                client_key_data: STANDARD.encode(client.key_pem.as_bytes()),
            },
        }],
        contexts: vec![NamedContext {
            name: context_name.clone(),
            context: ContextBinding {
                cluster: cluster_name.to_string(),
                user: user.to_string(),
            },
        }],
        current_context: context_name,
    };

    serde_yaml::to_string(&config)
        .map_err(|e| OperatorError::Serialization(format!("kubeconfig render failed: {}", e)))
}
