//! Serde model of the etcd JSON configuration file.
//!
//! The controller bakes a base config into a ConfigMap; the sidecar fills in
//! the member-specific fields and writes the final file next to etcd.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{Error, Result};

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(rename = "data-dir", default, skip_serializing_if = "String::is_empty")]
    pub data_dir: String,

    #[serde(rename = "wal-dir", default, skip_serializing_if = "String::is_empty")]
    pub wal_dir: String,

    #[serde(rename = "snapshot-count", default, skip_serializing_if = "is_zero")]
    pub snapshot_count: i64,

    #[serde(rename = "heartbeat-interval", default, skip_serializing_if = "is_zero")]
    pub heartbeat_interval: i64,

    #[serde(rename = "election-timeout", default, skip_serializing_if = "is_zero")]
    pub election_timeout: i64,

    #[serde(rename = "quota-backend-bytes", default, skip_serializing_if = "is_zero")]
    pub quota_backend_bytes: i64,

    #[serde(rename = "listen-peer-urls", default, skip_serializing_if = "String::is_empty")]
    pub listen_peer_urls: String,

    #[serde(rename = "listen-client-urls", default, skip_serializing_if = "String::is_empty")]
    pub listen_client_urls: String,

    #[serde(rename = "listen-metrics-urls", default, skip_serializing_if = "String::is_empty")]
    pub listen_metrics_urls: String,

    #[serde(
        rename = "initial-advertise-peer-urls",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub initial_advertise_peer_urls: String,

    #[serde(
        rename = "advertise-client-urls",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub advertise_client_urls: String,

    #[serde(rename = "initial-cluster", default, skip_serializing_if = "String::is_empty")]
    pub initial_cluster: String,

    #[serde(
        rename = "initial-cluster-token",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub initial_cluster_token: String,

    #[serde(rename = "initial-cluster-state", default, skip_serializing_if = "Option::is_none")]
    pub initial_cluster_state: Option<InitialState>,

    #[serde(
        rename = "client-transport-security",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_transport_security: Option<TransportSecurity>,

    #[serde(
        rename = "peer-transport-security",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub peer_transport_security: Option<TransportSecurity>,

    #[serde(rename = "strict-reconfig-check", default, skip_serializing_if = "is_false")]
    pub strict_reconfig_check: bool,

    #[serde(rename = "enable-pprof", default, skip_serializing_if = "is_false")]
    pub enable_pprof: bool,

    #[serde(rename = "log-level", default, skip_serializing_if = "String::is_empty")]
    pub log_level: String,

    #[serde(rename = "auto-compaction-mode", default, skip_serializing_if = "String::is_empty")]
    pub auto_compaction_mode: String,

    #[serde(
        rename = "auto-compaction-retention",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub auto_compaction_retention: String,

    #[serde(
        rename = "experimental-initial-corrupt-check",
        default,
        skip_serializing_if = "is_false"
    )]
    pub experimental_initial_corrupt_check: bool,

    #[serde(
        rename = "experimental-watch-progress-notify-interval",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub experimental_watch_progress_notify_interval: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransportSecurity {
    #[serde(rename = "cert-file")]
    pub cert_file: String,

    #[serde(rename = "key-file")]
    pub key_file: String,

    #[serde(rename = "client-cert-auth")]
    pub client_cert_auth: bool,

    #[serde(rename = "trusted-ca-file", default, skip_serializing_if = "String::is_empty")]
    pub trusted_ca_file: String,

    #[serde(rename = "auto-tls")]
    pub auto_tls: bool,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialState {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "existing")]
    Existing,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let data = std::fs::read(path).map_err(Error::ReadConfig)?;
        serde_json::from_slice(&data).map_err(Error::ParseConfig)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = self.to_json()?;
        std::fs::write(path, data).map_err(Error::WriteConfig)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(Error::EncodeConfig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_kebab_case_keys() {
        let config = Config {
            name: "member-0".to_string(),
            data_dir: "/var/lib/etcd/data".to_string(),
            snapshot_count: 10000,
            initial_cluster_state: Some(InitialState::New),
            auto_compaction_mode: "revision".to_string(),
            auto_compaction_retention: "100".to_string(),
            experimental_initial_corrupt_check: true,
            experimental_watch_progress_notify_interval: "5s".to_string(),
            ..Default::default()
        };

        let value: serde_json::Value = serde_json::from_slice(&config.to_json().unwrap()).unwrap();
        assert_eq!(value["data-dir"], "/var/lib/etcd/data");
        assert_eq!(value["snapshot-count"], 10000);
        assert_eq!(value["initial-cluster-state"], "new");
        assert_eq!(value["experimental-initial-corrupt-check"], true);
        assert_eq!(value["experimental-watch-progress-notify-interval"], "5s");
        // unset fields stay off the wire
        assert!(value.get("wal-dir").is_none());
        assert!(value.get("initial-cluster").is_none());
    }

    #[test]
    fn initial_state_round_trip() {
        let json = r#"{"initial-cluster-state":"existing"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.initial_cluster_state, Some(InitialState::Existing));
    }

    #[test]
    fn transport_security_round_trip() {
        let config = Config {
            client_transport_security: Some(TransportSecurity {
                cert_file: "/etc/etcd/pki/server/tls.crt".to_string(),
                key_file: "/etc/etcd/pki/server/tls.key".to_string(),
                client_cert_auth: true,
                trusted_ca_file: "/etc/etcd/pki/server/ca.crt".to_string(),
                auto_tls: false,
            }),
            ..Default::default()
        };

        let data = config.to_json().unwrap();
        let parsed: Config = serde_json::from_slice(&data).unwrap();
        assert_eq!(parsed, config);
    }
}
