pub mod apps;
pub mod batch;
pub mod builder;
pub mod cert_manager;
pub mod core;
pub mod pdb;
pub mod pki;
pub mod rbac;

pub use builder::{Builder, Child, Error, FIELD_MANAGER};
pub use cert_manager::{
    Certificate, CertificateRequest, CertificateRequestCondition, CertificateRequestSpec,
    CertificateRequestStatus, Issuer, KeyUsage, ObjectReference,
};
pub use pki::{format_duration, CertificateBuilder};
