//! Certificate issuance through cert-manager CertificateRequests.
//!
//! The private key never leaves the process: a key pair is generated locally,
//! a PKCS#10 CSR is submitted as a CertificateRequest bound to the issuer,
//! and the signed chain is read back from the request status.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, ResourceExt};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use thiserror::Error;
use tracing::debug;

use crate::etcd::Credentials;
use crate::resources::cert_manager::{
    CertificateRequest, CertificateRequestSpec, CONDITION_DENIED, CONDITION_INVALID_REQUEST,
    CONDITION_READY,
};
use crate::resources::Certificate;

/// Fallback when the prototype does not request a validity period (90 days,
/// cert-manager's default)
pub const DEFAULT_DURATION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum Error {
    #[error("generate key: {0}")]
    KeyGen(rcgen::Error),

    #[error("encode certificate request: {0}")]
    Csr(rcgen::Error),

    #[error("invalid ip san {address}: {source}")]
    InvalidIp {
        address: String,
        source: std::net::AddrParseError,
    },

    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("certificate request rejected: {0}")]
    Rejected(String),

    #[error("certificate request {0} is ready without a certificate")]
    MissingCertificate(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Generate credentials for a certificate prototype.
///
/// Polls the created CertificateRequest at `interval` until it is signed or
/// rejected. Cancellation leaves the request behind; the next attempt deletes
/// it by name before resubmitting.
pub async fn generate_credentials(
    client: &kube::Client,
    certificate: &Certificate,
    interval: Duration,
) -> Result<Credentials> {
    let key_pair = KeyPair::generate().map_err(Error::KeyGen)?;
    let key = key_pair.serialize_pem().into_bytes();

    let request = certificate_request(certificate, &key_pair)?;
    let namespace = certificate.metadata.namespace.clone().unwrap_or_default();
    let name = request.name_any();

    let api: Api<CertificateRequest> = Api::namespaced(client.clone(), &namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => debug!(%name, "deleted stale certificate request"),
        Err(kube::Error::Api(response)) if response.code == 404 => {}
        Err(err) => return Err(err.into()),
    }

    let created = api.create(&PostParams::default(), &request).await?;

    let signed = poll_ready(&api, &name, interval).await?;
    let status = signed.status.unwrap_or_default();
    let cert = status
        .certificate
        .ok_or_else(|| Error::MissingCertificate(name.clone()))?;

    let duration = certificate
        .spec
        .duration
        .as_deref()
        .and_then(|d| humantime::parse_duration(d).ok())
        .unwrap_or(DEFAULT_DURATION);
    let renew_at = created
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|ts| ts.0)
        .unwrap_or_else(Utc::now)
        + chrono::Duration::from_std(duration * 3 / 4).unwrap_or_else(|_| chrono::Duration::zero());

    Ok(Credentials {
        key,
        cert: cert.0,
        ca_cert: status.ca.map(|ca| ca.0).unwrap_or_default(),
        renew_at: Some(renew_at),
    })
}

/// Encode the PKCS#10 request for a certificate prototype
fn certificate_request(
    certificate: &Certificate,
    key_pair: &KeyPair,
) -> Result<CertificateRequest> {
    let spec = &certificate.spec;

    let mut params =
        CertificateParams::new(spec.dns_names.clone()).map_err(Error::Csr)?;
    if !spec.common_name.is_empty() {
        params
            .distinguished_name
            .push(DnType::CommonName, spec.common_name.clone());
    }
    for address in &spec.ip_addresses {
        let ip = address.parse().map_err(|source| Error::InvalidIp {
            address: address.clone(),
            source,
        })?;
        params.subject_alt_names.push(SanType::IpAddress(ip));
    }

    let csr = params.serialize_request(key_pair).map_err(Error::Csr)?;
    let csr_pem = csr.pem().map_err(Error::Csr)?;

    Ok(CertificateRequest {
        api_version: crate::resources::cert_manager::API_VERSION.to_string(),
        kind: "CertificateRequest".to_string(),
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            namespace: certificate.metadata.namespace.clone(),
            name: certificate.metadata.name.clone(),
            labels: certificate.metadata.labels.clone(),
            annotations: certificate.metadata.annotations.clone(),
            owner_references: certificate.metadata.owner_references.clone(),
            ..Default::default()
        },
        spec: CertificateRequestSpec {
            request: ByteString(csr_pem.into_bytes()),
            duration: spec.duration.clone(),
            issuer_ref: spec.issuer_ref.clone(),
            usages: spec.usages.clone(),
        },
        status: None,
    })
}

async fn poll_ready(
    api: &Api<CertificateRequest>,
    name: &str,
    interval: Duration,
) -> Result<CertificateRequest> {
    loop {
        match api.get(name).await {
            Ok(request) => {
                if check_conditions(&request)? {
                    return Ok(request);
                }
            }
            // throttled, try again on the next tick
            Err(kube::Error::Api(response)) if response.code == 429 => {
                debug!(%name, "certificate request poll throttled");
            }
            Err(err) => return Err(err.into()),
        }

        tokio::time::sleep(interval).await;
    }
}

/// true when signed, false while pending, Err on rejection
fn check_conditions(request: &CertificateRequest) -> Result<bool> {
    let Some(status) = &request.status else {
        return Ok(false);
    };

    for cond in &status.conditions {
        if cond.status != "True" {
            continue;
        }

        match cond.type_.as_str() {
            CONDITION_DENIED | CONDITION_INVALID_REQUEST => {
                return Err(Error::Rejected(cond.type_.clone()));
            }
            CONDITION_READY => return Ok(true),
            _ => {}
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::cert_manager::{
        CertificateRequestCondition, CertificateRequestStatus, CertificateSpec, ObjectReference,
        API_VERSION,
    };

    fn prototype() -> Certificate {
        Certificate {
            api_version: API_VERSION.to_string(),
            kind: "Certificate".to_string(),
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("pod-0-server".to_string()),
                namespace: Some("etcd-system".to_string()),
                ..Default::default()
            },
            spec: CertificateSpec {
                common_name: "pod-0-server".to_string(),
                secret_name: "pod-0-server".to_string(),
                issuer_ref: ObjectReference::issuer("main-server-ca"),
                dns_names: vec!["localhost".to_string(), "pod-0".to_string()],
                ip_addresses: vec!["127.0.0.1".to_string()],
                duration: Some("2160h".to_string()),
                ..Default::default()
            },
        }
    }

    fn request_with_condition(type_: &str, status: &str) -> CertificateRequest {
        CertificateRequest {
            api_version: API_VERSION.to_string(),
            kind: "CertificateRequest".to_string(),
            metadata: Default::default(),
            spec: CertificateRequestSpec::default(),
            status: Some(CertificateRequestStatus {
                conditions: vec![CertificateRequestCondition {
                    type_: type_.to_string(),
                    status: status.to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn csr_carries_sans_and_issuer() {
        let key_pair = KeyPair::generate().unwrap();
        let request = certificate_request(&prototype(), &key_pair).unwrap();

        assert_eq!(request.metadata.name.as_deref(), Some("pod-0-server"));
        assert_eq!(request.spec.issuer_ref.name, "main-server-ca");
        assert_eq!(request.spec.duration.as_deref(), Some("2160h"));

        let pem = String::from_utf8(request.spec.request.0.clone()).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE REQUEST"));
    }

    #[test]
    fn invalid_ip_is_rejected() {
        let mut certificate = prototype();
        certificate.spec.ip_addresses = vec!["not-an-ip".to_string()];

        let key_pair = KeyPair::generate().unwrap();
        let err = certificate_request(&certificate, &key_pair).unwrap_err();
        assert!(matches!(err, Error::InvalidIp { .. }));
    }

    #[test]
    fn ready_condition_completes() {
        let request = request_with_condition(CONDITION_READY, "True");
        assert!(check_conditions(&request).unwrap());
    }

    #[test]
    fn denied_condition_fails() {
        let request = request_with_condition(CONDITION_DENIED, "True");
        assert!(matches!(
            check_conditions(&request),
            Err(Error::Rejected(_))
        ));
    }

    #[test]
    fn false_conditions_keep_polling() {
        let request = request_with_condition(CONDITION_READY, "False");
        assert!(!check_conditions(&request).unwrap());

        let pending = request_with_condition("Approved", "True");
        assert!(!check_conditions(&pending).unwrap());
    }
}
