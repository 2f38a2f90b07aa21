//! PKI mint for tenant control planes.
//!
//! Every tenant gets a self-contained trust domain: one root CA, leaf
//! serving/client certificates for etcd, the front proxy and the API server,
//! a standalone service-account signing key, and two kubeconfigs rendered
//! against the root. Key material is ECDSA P-256 (rcgen's default; rcgen
//! does not generate RSA keys).

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};

use crate::crd::{ClusterVersion, VirtualCluster};
use crate::error::{OperatorError, Result};
use crate::kubeconfig;

/// Common name of every tenant root CA.
pub const ROOT_CA_COMMON_NAME: &str = "kubernetes";
/// Organization of every tenant root CA.
pub const ROOT_CA_ORGANIZATION: &str = "kubernetes-sig.kubernetes-sigs/multi-tenancy.virtualcluster";

const NOT_BEFORE: (i32, u8, u8) = (2025, 1, 1);
const NOT_AFTER: (i32, u8, u8) = (2035, 1, 1);

/// A PEM-encoded certificate and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// A PEM-encoded signing key pair with no certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningKey {
    pub public_key_pem: String,
    pub private_key_pem: String,
}

/// The complete PKI bundle for one tenant control plane.
#[derive(Debug, Clone)]
pub struct CaGroup {
    pub root_ca: CrtKeyPair,
    pub etcd: CrtKeyPair,
    pub front_proxy: CrtKeyPair,
    pub api_server: CrtKeyPair,
    pub service_account_key: SigningKey,
    pub ctrl_mgr_kubeconfig: String,
    pub admin_kubeconfig: String,
}

/// Mint the full PKI bundle for `vc`.
///
/// `api_server_cluster_ip` must be the allocated ClusterIP of the API server
/// service when the service type is ClusterIP, and `None` otherwise. No
/// retries happen here; the caller decides what a failure means.
pub fn mint(
    vc: &VirtualCluster,
    cv: &ClusterVersion,
    api_server_cluster_ip: Option<&str>,
) -> Result<CaGroup> {
    let root_ns = vc.root_namespace();
    let root_ca = new_root_ca()?;

    // Leaf order is load-bearing: the API server certificate embeds the
    // service cluster IP, which only exists once the service does.
    let etcd = new_etcd_server_cert(&root_ca, &cv.spec.etcd_domains(&root_ns))?;
    let front_proxy = new_front_proxy_client_cert(&root_ca)?;

    let api_server_domain = cv.spec.api_server_domain(&root_ns);
    let api_server = new_api_server_cert(&root_ca, &api_server_domain, api_server_cluster_ip)?;

    let service_account_key = new_service_account_signing_key()?;

    let api_address = api_server_cluster_ip.unwrap_or(&api_server_domain);
    let api_port = cv
        .spec
        .api_server
        .service
        .as_ref()
        .map(|s| s.port)
        .unwrap_or(6443);
    let cluster_name = vc.metadata.name.clone().unwrap_or_default();

    let ctrl_mgr_kubeconfig = kubeconfig::generate_kubeconfig(
        "system:kube-controller-manager",
        &cluster_name,
        api_address,
        api_port,
        &[],
        &root_ca,
    )?;
    let admin_kubeconfig = kubeconfig::generate_kubeconfig(
        "admin",
        &cluster_name,
        api_address,
        api_port,
        &["system:masters".to_string()],
        &root_ca,
    )?;

    Ok(CaGroup {
        root_ca,
        etcd,
        front_proxy,
        api_server,
        service_account_key,
        ctrl_mgr_kubeconfig,
        admin_kubeconfig,
    })
}

fn keygen_err(e: rcgen::Error) -> OperatorError {
    OperatorError::Pki(format!("key generation failed: {}", e))
}

fn encode_err(e: rcgen::Error) -> OperatorError {
    OperatorError::Pki(format!("certificate encoding failed: {}", e))
}

fn distinguished_name(common_name: &str, organizations: &[String]) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    for org in organizations {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
    }
    dn
}

fn dns_san(name: &str) -> Result<SanType> {
    let ia5 = Ia5String::try_from(name.to_string())
        .map_err(|e| OperatorError::Pki(format!("invalid DNS SAN {name:?}: {e}")))?;
    Ok(SanType::DnsName(ia5))
}

/// Generate the tenant root certificate authority.
pub fn new_root_ca() -> Result<CrtKeyPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(
        ROOT_CA_COMMON_NAME,
        &[ROOT_CA_ORGANIZATION.to_string()],
    );
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = rcgen::date_time_ymd(NOT_BEFORE.0, NOT_BEFORE.1, NOT_BEFORE.2);
    params.not_after = rcgen::date_time_ymd(NOT_AFTER.0, NOT_AFTER.1, NOT_AFTER.2);

    let key_pair = KeyPair::generate().map_err(keygen_err)?;
    let cert = params.self_signed(&key_pair).map_err(encode_err)?;

    Ok(CrtKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn new_leaf_cert(
    root: &CrtKeyPair,
    common_name: &str,
    organizations: &[String],
    sans: Vec<SanType>,
    extended_usages: Vec<ExtendedKeyUsagePurpose>,
) -> Result<CrtKeyPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, organizations);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = extended_usages;
    params.subject_alt_names = sans;
    params.not_before = rcgen::date_time_ymd(NOT_BEFORE.0, NOT_BEFORE.1, NOT_BEFORE.2);
    params.not_after = rcgen::date_time_ymd(NOT_AFTER.0, NOT_AFTER.1, NOT_AFTER.2);

    let leaf_key = KeyPair::generate().map_err(keygen_err)?;
    let root_key = KeyPair::from_pem(&root.key_pem)
        .map_err(|e| OperatorError::Pki(format!("failed to load root key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&root.cert_pem, &root_key)
        .map_err(|e| OperatorError::Pki(format!("failed to load root certificate: {}", e)))?;

    let cert = params.signed_by(&leaf_key, &issuer).map_err(encode_err)?;

    Ok(CrtKeyPair {
        cert_pem: cert.pem(),
        key_pem: leaf_key.serialize_pem(),
    })
}

/// Serving certificate for the etcd members, covering every peer domain.
pub fn new_etcd_server_cert(root: &CrtKeyPair, domains: &[String]) -> Result<CrtKeyPair> {
    let mut sans = Vec::with_capacity(domains.len());
    for domain in domains {
        sans.push(dns_san(domain)?);
    }
    new_leaf_cert(
        root,
        "etcd-server",
        &[],
        sans,
        vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ],
    )
}

/// Client certificate the API server presents to the front proxy.
pub fn new_front_proxy_client_cert(root: &CrtKeyPair) -> Result<CrtKeyPair> {
    new_leaf_cert(
        root,
        "front-proxy-client",
        &[],
        Vec::new(),
        vec![ExtendedKeyUsagePurpose::ClientAuth],
    )
}

/// Serving certificate for the tenant API server. The cluster IP SAN is
/// present only when the service type is ClusterIP and the address was
/// obtainable in time.
pub fn new_api_server_cert(
    root: &CrtKeyPair,
    domain: &str,
    cluster_ip: Option<&str>,
) -> Result<CrtKeyPair> {
    let mut sans = vec![
        dns_san(domain)?,
        dns_san("kubernetes")?,
        dns_san("kubernetes.default")?,
        dns_san("kubernetes.default.svc")?,
    ];
    if let Some(ip) = cluster_ip {
        let addr = ip
            .parse::<std::net::IpAddr>()
            .map_err(|e| OperatorError::Pki(format!("invalid cluster IP {ip:?}: {e}")))?;
        sans.push(SanType::IpAddress(addr));
    }
    new_leaf_cert(
        root,
        "kube-apiserver",
        &[],
        sans,
        vec![ExtendedKeyUsagePurpose::ServerAuth],
    )
}

/// Client certificate for a kubeconfig user; groups map to organizations.
pub fn new_client_cert(
    root: &CrtKeyPair,
    user: &str,
    groups: &[String],
) -> Result<CrtKeyPair> {
    new_leaf_cert(
        root,
        user,
        groups,
        Vec::new(),
        vec![ExtendedKeyUsagePurpose::ClientAuth],
    )
}

/// Standalone key pair for signing service-account tokens.
pub fn new_service_account_signing_key() -> Result<SigningKey> {
    let key_pair = KeyPair::generate().map_err(keygen_err)?;
    Ok(SigningKey {
        public_key_pem: key_pair.public_key_pem(),
        private_key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterVersionSpec, ComponentBundle, ComponentResources, ComponentService, SchedulingSlice,
    };
    use kube::core::ObjectMeta;
    use x509_parser::prelude::*;

    fn parse_cert(pem: &str) -> (Vec<u8>, String, String) {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = parsed.parse_x509().unwrap();
        (
            parsed.contents.clone(),
            cert.subject().to_string(),
            cert.issuer().to_string(),
        )
    }

    fn san_entries(pem: &str) -> (Vec<String>, Vec<String>) {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = parsed.parse_x509().unwrap();
        let mut dns = Vec::new();
        let mut ips = Vec::new();
        if let Ok(Some(ext)) = cert.subject_alternative_name() {
            for name in &ext.value.general_names {
                match name {
                    GeneralName::DNSName(d) => dns.push(d.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if bytes.len() == 4 {
                            ips.push(format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]));
                        }
                    }
                    _ => {}
                }
            }
        }
        (dns, ips)
    }

    fn bundle(name: &str) -> ComponentBundle {
        ComponentBundle {
            name: name.to_string(),
            image: "img".to_string(),
            replicas: 1,
            command: Vec::new(),
            args: Vec::new(),
            ports: Vec::new(),
            resources: ComponentResources::default(),
            storage: None,
            service: None,
        }
    }

    fn fixtures() -> (VirtualCluster, ClusterVersion) {
        let vc = VirtualCluster {
            metadata: ObjectMeta {
                name: Some("demo".to_string()),
                namespace: Some("vc-a".to_string()),
                uid: Some("6a2d1c4e-9f30-4bfa-8d5c-0123456789ab".to_string()),
                ..Default::default()
            },
            spec: crate::crd::VirtualClusterSpec {
                cluster_version_name: "v1".to_string(),
                extra_labels: Default::default(),
            },
            status: None,
        };
        let cv = ClusterVersion {
            metadata: ObjectMeta {
                name: Some("v1".to_string()),
                ..Default::default()
            },
            spec: ClusterVersionSpec {
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
            },
        };
        (vc, cv)
    }

    #[test]
    fn test_leaves_chain_to_root() {
        let (vc, cv) = fixtures();
        let group = mint(&vc, &cv, Some("10.96.0.10")).unwrap();

        let (_, root_subject, root_issuer) = parse_cert(&group.root_ca.cert_pem);
        assert_eq!(root_subject, root_issuer, "root CA must be self-signed");
        assert!(root_subject.contains("CN=kubernetes"));

        for leaf in [&group.etcd, &group.front_proxy, &group.api_server] {
            let (_, _, issuer) = parse_cert(&leaf.cert_pem);
            assert_eq!(issuer, root_subject);
        }
    }

    #[test]
    fn test_api_server_sans_with_cluster_ip() {
        let (vc, cv) = fixtures();
        let group = mint(&vc, &cv, Some("10.96.0.10")).unwrap();
        let (dns, ips) = san_entries(&group.api_server.cert_pem);
        assert!(dns.contains(&"apiserver.vc-a-6a2d1c-demo.svc".to_string()));
        assert_eq!(ips, vec!["10.96.0.10"]);
    }

    #[test]
    fn test_api_server_sans_without_cluster_ip() {
        let (vc, cv) = fixtures();
        let group = mint(&vc, &cv, None).unwrap();
        let (dns, ips) = san_entries(&group.api_server.cert_pem);
        assert!(dns.contains(&"apiserver.vc-a-6a2d1c-demo.svc".to_string()));
        assert!(ips.is_empty());
    }

    #[test]
    fn test_etcd_cert_covers_every_peer() {
        let (vc, cv) = fixtures();
        let group = mint(&vc, &cv, None).unwrap();
        let (dns, _) = san_entries(&group.etcd.cert_pem);
        for expected in [
            "etcd.vc-a-6a2d1c-demo.svc",
            "etcd-0.etcd.vc-a-6a2d1c-demo.svc",
            "etcd-2.etcd.vc-a-6a2d1c-demo.svc",
        ] {
            assert!(dns.contains(&expected.to_string()), "missing SAN {expected}");
        }
    }

    #[test]
    fn test_client_cert_carries_groups_as_orgs() {
        let root = new_root_ca().unwrap();
        let admin = new_client_cert(&root, "admin", &["system:masters".to_string()]).unwrap();
        let (_, subject, _) = parse_cert(&admin.cert_pem);
        assert!(subject.contains("CN=admin"));
        assert!(subject.contains("O=system:masters"));
    }

    #[test]
    fn test_service_account_key_has_both_halves() {
        let key = new_service_account_signing_key().unwrap();
        assert!(key.public_key_pem.contains("PUBLIC KEY"));
        assert!(key.private_key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_invalid_cluster_ip_is_rejected() {
        let root = new_root_ca().unwrap();
        let err = new_api_server_cert(&root, "apiserver.ns.svc", Some("not-an-ip")).unwrap_err();
        assert!(matches!(err, OperatorError::Pki(_)));
    }
}
