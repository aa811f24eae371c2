//! PKI child resources: certificate authorities, issuers and certificate
//! prototypes.
//!
//! A `ca(name)` renders a CA certificate signed by the cluster-wide
//! "self-sign" ClusterIssuer plus a namespaced CA Issuer backed by the CA's
//! secret; leaf certificates then reference that issuer.

use std::time::Duration;

use super::builder::{Builder, Child};
use super::cert_manager::{
    CaIssuer, Certificate, CertificatePrivateKey, CertificateSpec, Issuer, IssuerSpec, KeyUsage,
    ObjectReference, API_VERSION,
};

const CA_DURATION: Duration = Duration::from_secs(5 * 365 * 24 * 60 * 60);

/// Go-style duration string accepted by cert-manager
pub fn format_duration(duration: Duration) -> String {
    format!("{}h", duration.as_secs() / 3600)
}

impl Builder {
    /// Render a certificate authority: CA certificate plus the Issuer that
    /// signs with it.
    pub fn ca(&mut self, name: &str) {
        let certificate = self.certificate(name).ca().duration(CA_DURATION);
        self.add(certificate);

        let issuer = self.ca_issuer(name);
        self.add(issuer);
    }

    /// CA issuer signing with the key pair in the same-named secret
    pub fn ca_issuer(&self, name: &str) -> Issuer {
        let name = self.child_name(&[name]);
        Issuer::new(
            self.namespace().map(str::to_string),
            name.clone(),
            IssuerSpec {
                ca: Some(CaIssuer { secret_name: name }),
                ..Default::default()
            },
        )
    }

    pub fn certificate(&self, name: &str) -> CertificateBuilder {
        let name = self.child_name(&[name]);
        CertificateBuilder {
            certificate: Certificate {
                api_version: API_VERSION.to_string(),
                kind: "Certificate".to_string(),
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    name: Some(name.clone()),
                    namespace: self.namespace().map(str::to_string),
                    ..Default::default()
                },
                spec: CertificateSpec {
                    common_name: name.clone(),
                    secret_name: name,
                    private_key: Some(CertificatePrivateKey {
                        algorithm: Some("ECDSA".to_string()),
                        size: Some(256),
                    }),
                    usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
                    ..Default::default()
                },
            },
        }
    }
}

pub struct CertificateBuilder {
    certificate: Certificate,
}

impl CertificateBuilder {
    /// Mark as a CA certificate, issued by the cluster-wide self-sign issuer
    pub fn ca(mut self) -> Self {
        self.certificate.spec.is_ca = true;
        self.certificate.spec.issuer_ref = ObjectReference::cluster_issuer("self-sign");
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.certificate.spec.duration = Some(format_duration(duration));
        self
    }

    pub fn issuer(mut self, name: impl Into<String>) -> Self {
        self.certificate.spec.issuer_ref = ObjectReference::issuer(name);
        self
    }

    pub fn usages(mut self, usages: &[KeyUsage]) -> Self {
        self.certificate.spec.usages.extend_from_slice(usages);
        self
    }

    /// DNS SAN from dot-joined parts
    pub fn dns(mut self, parts: &[&str]) -> Self {
        self.certificate.spec.dns_names.push(parts.join("."));
        self
    }

    pub fn ip(mut self, address: impl Into<String>) -> Self {
        self.certificate.spec.ip_addresses.push(address.into());
        self
    }

    pub fn build(self) -> Certificate {
        self.certificate
    }
}

impl From<CertificateBuilder> for Child {
    fn from(builder: CertificateBuilder) -> Child {
        Child::Certificate(builder.certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    fn builder() -> Builder {
        let mut cluster =
            EtcdCluster::new("main", serde_json::from_str::<EtcdClusterSpec>("{}").unwrap());
        cluster.metadata.namespace = Some("etcd-system".to_string());
        Builder::new(&cluster)
    }

    #[test]
    fn ca_renders_certificate_and_issuer() {
        let mut b = builder();
        b.ca("server-ca");

        let children = b.children();
        assert_eq!(children.len(), 2);

        let Child::Certificate(cert) = &children[0] else {
            panic!("expected certificate");
        };
        assert_eq!(cert.metadata.name.as_deref(), Some("main-server-ca"));
        assert!(cert.spec.is_ca);
        assert_eq!(cert.spec.issuer_ref.kind, "ClusterIssuer");
        assert_eq!(cert.spec.issuer_ref.name, "self-sign");
        assert_eq!(cert.spec.duration.as_deref(), Some("43800h"));

        let Child::Issuer(issuer) = &children[1] else {
            panic!("expected issuer");
        };
        assert_eq!(issuer.metadata.name.as_deref(), Some("main-server-ca"));
        assert_eq!(
            issuer.spec.ca.as_ref().unwrap().secret_name,
            "main-server-ca"
        );
    }

    #[test]
    fn leaf_certificate_prototype() {
        let b = builder();
        let cert = b
            .certificate("user-root")
            .issuer("main-server-ca")
            .usages(&[KeyUsage::ClientAuth])
            .build();

        assert_eq!(cert.spec.secret_name, "main-user-root");
        assert_eq!(cert.spec.issuer_ref.name, "main-server-ca");
        assert!(cert.spec.usages.contains(&KeyUsage::ClientAuth));
        // base usages are kept
        assert!(cert.spec.usages.contains(&KeyUsage::DigitalSignature));
    }

    #[test]
    fn sans_are_joined() {
        let b = builder();
        let cert = b
            .certificate("server")
            .dns(&["main", "etcd-system", "svc.cluster.local"])
            .ip("10.0.0.12")
            .build();

        assert_eq!(cert.spec.dns_names, vec!["main.etcd-system.svc.cluster.local"]);
        assert_eq!(cert.spec.ip_addresses, vec!["10.0.0.12"]);
    }
}
