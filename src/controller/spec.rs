//! Desired-state rendering: the etcd base configuration and the pod specs of
//! the member deployment and maintenance jobs.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    EnvVarSource, HTTPGetAction, LocalObjectReference, ObjectFieldSelector, PodAffinityTerm,
    PodAntiAffinity, PodSpec, Probe, ResourceRequirements, SecretEnvSource, SecretVolumeSource,
    Volume, VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{cluster_label_value, ClusterPhase, EtcdCluster, CLUSTER_LABEL};
use crate::etcd::{Config as EtcdConfig, InitialState, TransportSecurity};
use crate::etcd::{CA_CERT_FILE, CERT_FILE, KEY_FILE};

use super::context::OperatorConfig;

pub const BASE_CONFIG_FILE: &str = "/etc/etcd/config/base/etcd.json";
pub const CONFIG_FILE: &str = "/etc/etcd/config/etcd.json";
pub const CREDENTIALS_DIR: &str = "/etc/etcd/pki";
pub const SERVER_CREDENTIALS_DIR: &str = "/etc/etcd/pki/server";
pub const PEER_CREDENTIALS_DIR: &str = "/etc/etcd/pki/peer";
pub const DATA_DIR: &str = "/var/lib/etcd/data";

pub const DEFRAG_SCHEDULE: &str = "0 1 * * *"; // 1:00 AM every day
pub const BACKUP_SCHEDULE: &str = "0 * * * *"; // every hour
pub const JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const ACTIVE_DEADLINE: Duration = Duration::from_secs(5 * 60);

const DEFAULT_CPU: &str = "4";
const DEFAULT_MEMORY: &str = "8G";
const INIT_CPU: &str = "1";
const INIT_MEMORY: &str = "128M";

/// Parse a Kubernetes quantity into bytes; supports decimal (k/M/G/T) and
/// binary (Ki/Mi/Gi/Ti) suffixes.
pub fn parse_quantity(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    let suffixes: [(&str, f64); 9] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, scale) in suffixes {
        if let Some(number) = quantity.strip_suffix(suffix) {
            let value: f64 = number.parse().ok()?;
            return Some((value * scale) as i64);
        }
    }

    quantity.parse::<f64>().ok().map(|v| v as i64)
}

/// Data volume size limit: explicit quota, then storage/memory limits, then
/// the default memory size (storage is memory-backed).
pub fn storage_quota(cluster: &EtcdCluster) -> String {
    if let Some(quota) = &cluster.spec.storage_quota {
        return quota.clone();
    }

    let limits = cluster.spec.resources.as_ref().and_then(|r| r.limits.as_ref());
    if let Some(storage) = limits.and_then(|l| l.storage.clone()) {
        return storage;
    }
    if let Some(memory) = limits.and_then(|l| l.memory.clone()) {
        return memory;
    }

    DEFAULT_MEMORY.to_string()
}

/// Member container resources: defaults overridden by spec limits
fn member_resources(cluster: &EtcdCluster) -> BTreeMap<String, Quantity> {
    let mut resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(DEFAULT_CPU.to_string())),
        ("memory".to_string(), Quantity(DEFAULT_MEMORY.to_string())),
    ]);

    let limits = cluster.spec.resources.as_ref().and_then(|r| r.limits.as_ref());
    if let Some(cpu) = limits.and_then(|l| l.cpu.clone()) {
        resources.insert("cpu".to_string(), Quantity(cpu));
    }
    if let Some(memory) = limits.and_then(|l| l.memory.clone()) {
        resources.insert("memory".to_string(), Quantity(memory));
    }

    resources
}

fn init_resources() -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(INIT_CPU.to_string())),
        ("memory".to_string(), Quantity(INIT_MEMORY.to_string())),
    ])
}

fn guaranteed(resources: BTreeMap<String, Quantity>) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(resources.clone()),
        limits: Some(resources),
        ..Default::default()
    }
}

/// Base etcd configuration baked into the cluster ConfigMap
pub fn etcd_config(cluster: &EtcdCluster) -> EtcdConfig {
    let initial_state = match cluster.phase() {
        Some(ClusterPhase::Bootstrap) => InitialState::New,
        _ => InitialState::Existing,
    };

    let quota = parse_quantity(&storage_quota(cluster)).unwrap_or(8_000_000_000);

    EtcdConfig {
        initial_cluster_state: Some(initial_state),
        initial_cluster_token: cluster.name_any(),
        data_dir: DATA_DIR.to_string(),
        quota_backend_bytes: quota,
        snapshot_count: 10000,
        auto_compaction_mode: "revision".to_string(),
        auto_compaction_retention: "100".to_string(),
        listen_client_urls: "https://0.0.0.0:2379".to_string(),
        listen_peer_urls: "https://0.0.0.0:2380".to_string(),
        listen_metrics_urls: "http://0.0.0.0:2381".to_string(),
        client_transport_security: Some(transport_security(SERVER_CREDENTIALS_DIR)),
        peer_transport_security: Some(transport_security(PEER_CREDENTIALS_DIR)),
        experimental_initial_corrupt_check: true,
        experimental_watch_progress_notify_interval: "5s".to_string(),
        ..Default::default()
    }
}

fn transport_security(dir: &str) -> TransportSecurity {
    TransportSecurity {
        cert_file: format!("{dir}/{CERT_FILE}"),
        key_file: format!("{dir}/{KEY_FILE}"),
        trusted_ca_file: format!("{dir}/{CA_CERT_FILE}"),
        client_cert_auth: true,
        auto_tls: false,
    }
}

/// Member pod: sidecar init container (restarting), etcd container, optional
/// restore init container, anti-affinity across hosts.
pub fn pod_spec(cluster: &EtcdCluster, config: &OperatorConfig, restore_key: Option<&str>) -> PodSpec {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_label = cluster_label_value(&name, &namespace);

    let affinity = Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 1,
                    pod_affinity_term: PodAffinityTerm {
                        topology_key: "kubernetes.io/hostname".to_string(),
                        label_selector: Some(LabelSelector {
                            match_labels: Some(BTreeMap::from([(
                                CLUSTER_LABEL.to_string(),
                                cluster_label,
                            )])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "base-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "pki".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "config".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                size_limit: Some(Quantity(storage_quota(cluster))),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let mut init_containers = vec![sidecar_container(cluster, config)];
    if let Some(key) = restore_key {
        init_containers.push(restore_container(cluster, config, key));
    }

    let etcd = Container {
        name: "etcd".to_string(),
        image: Some(format!("{}:{}", config.image, cluster.spec.version)),
        command: Some(vec![
            "etcd".to_string(),
            format!("--config-file={CONFIG_FILE}"),
        ]),
        env: Some(vec![
            env_value("ETCDCTL_CACERT", format!("{SERVER_CREDENTIALS_DIR}/{CA_CERT_FILE}")),
            env_value("ETCDCTL_CERT", format!("{SERVER_CREDENTIALS_DIR}/{CERT_FILE}")),
            env_value("ETCDCTL_KEY", format!("{SERVER_CREDENTIALS_DIR}/{KEY_FILE}")),
        ]),
        volume_mounts: Some(vec![
            volume_mount("data", "/var/lib/etcd", false),
            volume_mount("config", "/etc/etcd/config", true),
            volume_mount("pki", CREDENTIALS_DIR, true),
        ]),
        startup_probe: Some(Probe {
            failure_threshold: Some(24),
            initial_delay_seconds: Some(5),
            period_seconds: Some(5),
            success_threshold: Some(1),
            timeout_seconds: Some(15),
            http_get: Some(metrics_probe("/health?serializable=false")),
            ..Default::default()
        }),
        liveness_probe: Some(Probe {
            failure_threshold: Some(8),
            period_seconds: Some(5),
            success_threshold: Some(1),
            timeout_seconds: Some(15),
            http_get: Some(metrics_probe("/health?exclude=NOSPACE&serializable=true")),
            ..Default::default()
        }),
        resources: Some(guaranteed(member_resources(cluster))),
        ..Default::default()
    };

    PodSpec {
        init_containers: Some(init_containers),
        containers: vec![etcd],
        affinity: Some(affinity),
        volumes: Some(volumes),
        service_account_name: Some(name),
        priority_class_name: cluster
            .spec
            .priority_class_name
            .clone()
            .or_else(|| config.priority_class_name.clone()),
        runtime_class_name: cluster.spec.runtime_class_name.clone(),
        ..Default::default()
    }
}

/// Lifecycle sidecar: a restarting init container so it is up before etcd and
/// stays up with it.
pub fn sidecar_container(cluster: &EtcdCluster, config: &OperatorConfig) -> Container {
    let endpoint = cluster
        .status
        .as_ref()
        .and_then(|s| s.endpoint.clone())
        .unwrap_or_default();

    Container {
        name: "sidecar".to_string(),
        image: Some(config.controller_image.clone()),
        restart_policy: Some("Always".to_string()),
        command: Some(vec!["etcd-sidecar".to_string()]),
        args: Some(vec![
            format!("--base-config={BASE_CONFIG_FILE}"),
            format!("--config={CONFIG_FILE}"),
            format!("--endpoint={endpoint}"),
            "--health-address=0.0.0.0:8081".to_string(),
        ]),
        env: Some(vec![
            env_field("POD_NAMESPACE", "metadata.namespace"),
            env_field("POD_NAME", "metadata.name"),
        ]),
        volume_mounts: Some(vec![
            volume_mount("base-config", "/etc/etcd/config/base", true),
            volume_mount("config", "/etc/etcd/config", false),
            volume_mount("pki", CREDENTIALS_DIR, false),
        ]),
        resources: Some(guaranteed(init_resources())),
        startup_probe: Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".to_string()),
                port: IntOrString::Int(8081),
                ..Default::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(5),
            failure_threshold: Some(24),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Restore init container, rendered only while bootstrapping from a snapshot
pub fn restore_container(cluster: &EtcdCluster, config: &OperatorConfig, key: &str) -> Container {
    Container {
        name: "restore".to_string(),
        image: Some(config.controller_image.clone()),
        command: Some(vec!["etcd-tools".to_string()]),
        args: Some(vec![
            "restore".to_string(),
            format!("--config={CONFIG_FILE}"),
            format!("--key={key}"),
        ]),
        env_from: Some(vec![backup_env_from(cluster)]),
        volume_mounts: Some(vec![
            volume_mount("config", "/etc/etcd/config", true),
            volume_mount("data", "/var/lib/etcd", false),
        ]),
        resources: Some(guaranteed(init_resources())),
        ..Default::default()
    }
}

/// Backup job pod: snapshots through the cluster service with the root user
/// credentials.
pub fn backup_pod_spec(cluster: &EtcdCluster, config: &OperatorConfig) -> PodSpec {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let endpoint = cluster
        .status
        .as_ref()
        .and_then(|s| s.endpoint.clone())
        .unwrap_or_default();

    let container = Container {
        name: "backup".to_string(),
        image: Some(config.controller_image.clone()),
        command: Some(vec!["etcd-tools".to_string()]),
        args: Some(vec![
            "backup".to_string(),
            format!("--endpoint={endpoint}"),
            format!("--credentials-dir={CREDENTIALS_DIR}"),
            format!("--prefix={namespace}/{name}"),
        ]),
        env_from: Some(vec![backup_env_from(cluster)]),
        volume_mounts: Some(vec![volume_mount("pki", CREDENTIALS_DIR, true)]),
        ..Default::default()
    };

    PodSpec {
        restart_policy: Some("OnFailure".to_string()),
        containers: vec![container],
        volumes: Some(vec![credentials_secret_volume(cluster)]),
        priority_class_name: config.priority_class_name.clone(),
        ..Default::default()
    }
}

/// Defrag job pod
pub fn defrag_pod_spec(cluster: &EtcdCluster, config: &OperatorConfig) -> PodSpec {
    let endpoint = cluster
        .status
        .as_ref()
        .and_then(|s| s.endpoint.clone())
        .unwrap_or_default();

    let mut args = vec![
        "defrag".to_string(),
        format!("--endpoint={endpoint}"),
        format!("--credentials-dir={CREDENTIALS_DIR}"),
    ];
    if let Some(threshold) = cluster.spec.defrag.as_ref().and_then(|d| d.threshold.as_ref()) {
        if let Some(ratio) = threshold.ratio {
            args.push(format!("--unused-ratio={ratio}"));
        }
        if let Some(size) = &threshold.size {
            args.push(format!("--unused-size={size}"));
        }
    }

    let container = Container {
        name: "defrag".to_string(),
        image: Some(config.controller_image.clone()),
        command: Some(vec!["etcd-tools".to_string()]),
        args: Some(args),
        volume_mounts: Some(vec![volume_mount("pki", CREDENTIALS_DIR, true)]),
        ..Default::default()
    };

    PodSpec {
        restart_policy: Some("OnFailure".to_string()),
        containers: vec![container],
        volumes: Some(vec![credentials_secret_volume(cluster)]),
        priority_class_name: config.priority_class_name.clone(),
        ..Default::default()
    }
}

/// Root user credentials mounted from the cluster's client secret
fn credentials_secret_volume(cluster: &EtcdCluster) -> Volume {
    let secret_name = cluster
        .status
        .as_ref()
        .and_then(|s| s.secret_name.clone())
        .unwrap_or_default();

    Volume {
        name: "pki".to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn backup_env_from(cluster: &EtcdCluster) -> EnvFromSource {
    EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: format!("{}-backup", cluster.name_any()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn metrics_probe(path: &str) -> HTTPGetAction {
    HTTPGetAction {
        path: Some(path.to_string()),
        port: IntOrString::Int(2381),
        scheme: Some("HTTP".to_string()),
        ..Default::default()
    }
}

fn env_value(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdClusterSpec, EtcdClusterStatus};

    fn test_cluster(phase: Option<ClusterPhase>) -> EtcdCluster {
        let mut cluster = EtcdCluster::new(
            "main",
            serde_json::from_str::<EtcdClusterSpec>(r#"{"replicas": 3}"#).unwrap(),
        );
        cluster.metadata.namespace = Some("etcd-system".to_string());
        cluster.status = Some(EtcdClusterStatus {
            phase,
            endpoint: Some("https://main.etcd-system.svc.cluster.local:2379".to_string()),
            secret_name: Some("main-user-root".to_string()),
            ..Default::default()
        });
        cluster
    }

    fn test_config() -> OperatorConfig {
        OperatorConfig {
            image: "quay.io/coreos/etcd".to_string(),
            controller_image: "ghcr.io/example/etcd-operator:latest".to_string(),
            priority_class_name: None,
            backup_env: Default::default(),
        }
    }

    #[test]
    fn parse_quantity_suffixes() {
        assert_eq!(parse_quantity("4G"), Some(4_000_000_000));
        assert_eq!(parse_quantity("128M"), Some(128_000_000));
        assert_eq!(parse_quantity("1Gi"), Some(1_073_741_824));
        assert_eq!(parse_quantity("512Ki"), Some(524_288));
        assert_eq!(parse_quantity("1024"), Some(1024));
        assert_eq!(parse_quantity("1.5G"), Some(1_500_000_000));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("abc"), None);
    }

    #[test]
    fn bootstrap_renders_new_cluster_state() {
        let config = etcd_config(&test_cluster(Some(ClusterPhase::Bootstrap)));
        assert_eq!(config.initial_cluster_state, Some(InitialState::New));
        assert_eq!(config.initial_cluster_token, "main");
        assert_eq!(config.quota_backend_bytes, 8_000_000_000);
    }

    #[test]
    fn running_renders_existing_cluster_state() {
        let config = etcd_config(&test_cluster(Some(ClusterPhase::Running)));
        assert_eq!(config.initial_cluster_state, Some(InitialState::Existing));
    }

    #[test]
    fn member_pod_layout() {
        let cluster = test_cluster(Some(ClusterPhase::Running));
        let spec = pod_spec(&cluster, &test_config(), None);

        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "sidecar");
        assert_eq!(init[0].restart_policy.as_deref(), Some("Always"));

        assert_eq!(spec.containers.len(), 1);
        let etcd = &spec.containers[0];
        assert_eq!(etcd.image.as_deref(), Some("quay.io/coreos/etcd:v3.5.14"));

        let liveness = etcd.liveness_probe.as_ref().unwrap();
        assert_eq!(
            liveness.http_get.as_ref().unwrap().path.as_deref(),
            Some("/health?exclude=NOSPACE&serializable=true")
        );
        let startup = etcd.startup_probe.as_ref().unwrap();
        assert_eq!(
            startup.http_get.as_ref().unwrap().path.as_deref(),
            Some("/health?serializable=false")
        );

        assert_eq!(spec.service_account_name.as_deref(), Some("main"));
        assert!(spec.affinity.as_ref().unwrap().pod_anti_affinity.is_some());
    }

    #[test]
    fn restore_container_is_rendered_with_key() {
        let cluster = test_cluster(Some(ClusterPhase::Bootstrap));
        let spec = pod_spec(&cluster, &test_config(), Some("etcd-system/main/20240601000000"));

        let init = spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[1].name, "restore");
        assert!(init[1]
            .args
            .as_ref()
            .unwrap()
            .contains(&"--key=etcd-system/main/20240601000000".to_string()));
    }

    #[test]
    fn defrag_threshold_flags() {
        let mut cluster = test_cluster(Some(ClusterPhase::Running));
        cluster.spec.defrag = Some(crate::crd::DefragSpec {
            threshold: Some(crate::crd::DefragThreshold {
                size: Some("256M".to_string()),
                ratio: Some(0.5),
            }),
            ..Default::default()
        });

        let spec = defrag_pod_spec(&cluster, &test_config());
        let args = spec.containers[0].args.as_ref().unwrap();
        assert!(args.contains(&"--unused-ratio=0.5".to_string()));
        assert!(args.contains(&"--unused-size=256M".to_string()));
    }

    #[test]
    fn backup_prefix_defaults_to_namespace_and_name() {
        let cluster = test_cluster(Some(ClusterPhase::Running));
        let spec = backup_pod_spec(&cluster, &test_config());
        let args = spec.containers[0].args.as_ref().unwrap();
        assert!(args.contains(&"--prefix=etcd-system/main".to_string()));

        let volume = &spec.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("main-user-root")
        );
    }
}
