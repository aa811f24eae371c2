pub mod config;
pub mod connect;
pub mod credentials;
pub mod errors;
pub mod tls_cache;

pub use config::{Config, InitialState, TransportSecurity};
pub use connect::connect;
pub use credentials::{Credentials, CA_CERT_FILE, CERT_FILE, KEY_FILE};
pub use tls_cache::TlsCache;

use std::sync::Arc;
use thiserror::Error;

/// Errors from etcd configuration and credential handling
#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("etcd client: {0}")]
    Client(#[from] etcd_client::Error),

    #[error("client certificate and key are required")]
    MissingKeyPair,

    #[error("read config: {0}")]
    ReadConfig(std::io::Error),

    #[error("parse config: {0}")]
    ParseConfig(serde_json::Error),

    #[error("write config: {0}")]
    WriteConfig(std::io::Error),

    #[error("encode config: {0}")]
    EncodeConfig(serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Shared(#[from] Arc<Error>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
