//! cert-manager Issuer, Certificate and CertificateRequest resources.
//!
//! These are external CRDs, modelled with the fields the operator uses and
//! wired into the typed client with manual `Resource` implementations.
//!
//! Reference: https://cert-manager.io/docs/concepts/

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::core::NamespaceResourceScope;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "cert-manager.io";
pub const VERSION: &str = "v1";
pub const API_VERSION: &str = "cert-manager.io/v1";

/// Key usages requested on issued certificates
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyUsage {
    #[serde(rename = "digital signature")]
    DigitalSignature,
    #[serde(rename = "key encipherment")]
    KeyEncipherment,
    #[serde(rename = "server auth")]
    ServerAuth,
    #[serde(rename = "client auth")]
    ClientAuth,
    #[serde(rename = "cert sign")]
    CertSign,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub name: String,
    pub kind: String,
    pub group: String,
}

impl ObjectReference {
    pub fn issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "Issuer".to_string(),
            group: GROUP.to_string(),
        }
    }

    pub fn cluster_issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "ClusterIssuer".to_string(),
            group: GROUP.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Issuer {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: IssuerSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_signed: Option<SelfSignedIssuer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<CaIssuer>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SelfSignedIssuer {}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    pub secret_name: String,
}

impl Issuer {
    pub fn new(namespace: Option<String>, name: impl Into<String>, spec: IssuerSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: "Issuer".to_string(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace,
                ..Default::default()
            },
            spec,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CertificateSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub common_name: String,

    /// Secret the issued key pair is stored in
    pub secret_name: String,

    #[serde(rename = "isCA", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_ca: bool,

    /// Requested validity as a Go duration string (e.g. "2160h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    pub issuer_ref: ObjectReference,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<CertificatePrivateKey>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePrivateKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CertificateRequestSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CertificateRequestStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM-encoded PKCS#10 certificate signing request
    pub request: ByteString,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    pub issuer_ref: ObjectReference,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<KeyUsage>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertificateRequestCondition>,

    /// Signed certificate chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ByteString>,

    /// CA bundle of the signing authority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ByteString>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_DENIED: &str = "Denied";
pub const CONDITION_INVALID_REQUEST: &str = "InvalidRequest";

macro_rules! cert_manager_resource {
    ($type:ty, $kind:literal, $plural:literal) => {
        impl kube::Resource for $type {
            type DynamicType = ();
            type Scope = NamespaceResourceScope;

            fn kind(_: &()) -> Cow<'_, str> {
                $kind.into()
            }

            fn group(_: &()) -> Cow<'_, str> {
                GROUP.into()
            }

            fn version(_: &()) -> Cow<'_, str> {
                VERSION.into()
            }

            fn plural(_: &()) -> Cow<'_, str> {
                $plural.into()
            }

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

cert_manager_resource!(Issuer, "Issuer", "issuers");
cert_manager_resource!(Certificate, "Certificate", "certificates");
cert_manager_resource!(CertificateRequest, "CertificateRequest", "certificaterequests");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_usage_wire_values() {
        assert_eq!(
            serde_json::to_value([KeyUsage::ServerAuth, KeyUsage::ClientAuth]).unwrap(),
            serde_json::json!(["server auth", "client auth"])
        );
    }

    #[test]
    fn certificate_serializes_type_meta() {
        let cert = Certificate {
            api_version: API_VERSION.to_string(),
            kind: "Certificate".to_string(),
            metadata: ObjectMeta {
                name: Some("main-user-root".to_string()),
                namespace: Some("etcd-system".to_string()),
                ..Default::default()
            },
            spec: CertificateSpec {
                secret_name: "main-user-root".to_string(),
                issuer_ref: ObjectReference::issuer("main-server-ca"),
                usages: vec![KeyUsage::ClientAuth],
                ..Default::default()
            },
        };

        let value = serde_json::to_value(&cert).unwrap();
        assert_eq!(value["apiVersion"], "cert-manager.io/v1");
        assert_eq!(value["kind"], "Certificate");
        assert_eq!(value["spec"]["issuerRef"]["kind"], "Issuer");
        assert!(value["spec"].get("isCA").is_none());
    }

    #[test]
    fn ready_condition_names() {
        let cond = CertificateRequestCondition {
            type_: CONDITION_READY.to_string(),
            status: "True".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&cond).unwrap();
        assert_eq!(value["type"], "Ready");
    }
}
