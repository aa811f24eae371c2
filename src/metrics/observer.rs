//! Per-cluster replica and backup gauges.
//!
//! Each cluster identity owns one label set per gauge; `update` publishes the
//! latest observation and `unregister` drops the label sets so a scrape emits
//! nothing for deleted clusters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::DateTime;
use prometheus_client::encoding::{EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::crd::EtcdCluster;
use kube::ResourceExt;

/// Cluster identity labels
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, mut encoder: LabelSetEncoder) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// The eight per-cluster gauges
pub struct ClusterGauges {
    desired_replicas: Family<ClusterLabels, Gauge>,
    replicas: Family<ClusterLabels, Gauge>,
    ready_replicas: Family<ClusterLabels, Gauge>,
    updated_replicas: Family<ClusterLabels, Gauge>,
    available_replicas: Family<ClusterLabels, Gauge>,
    learner_replicas: Family<ClusterLabels, Gauge>,
    backup_last_schedule_time: Family<ClusterLabels, Gauge>,
    backup_last_successful_time: Family<ClusterLabels, Gauge>,
}

impl ClusterGauges {
    pub fn register(registry: &mut Registry) -> Arc<Self> {
        let gauges = Arc::new(Self {
            desired_replicas: Family::default(),
            replicas: Family::default(),
            ready_replicas: Family::default(),
            updated_replicas: Family::default(),
            available_replicas: Family::default(),
            learner_replicas: Family::default(),
            backup_last_schedule_time: Family::default(),
            backup_last_successful_time: Family::default(),
        });

        registry.register(
            "etcd_cluster_desired_replicas",
            "Number of desired replicas",
            gauges.desired_replicas.clone(),
        );
        registry.register(
            "etcd_cluster_replicas",
            "Number of replicas",
            gauges.replicas.clone(),
        );
        registry.register(
            "etcd_cluster_ready_replicas",
            "Number of ready replicas",
            gauges.ready_replicas.clone(),
        );
        registry.register(
            "etcd_cluster_updated_replicas",
            "Number of updated replicas",
            gauges.updated_replicas.clone(),
        );
        registry.register(
            "etcd_cluster_available_replicas",
            "Number of available replicas",
            gauges.available_replicas.clone(),
        );
        registry.register(
            "etcd_cluster_learner_replicas",
            "Number of learner replicas",
            gauges.learner_replicas.clone(),
        );
        registry.register(
            "etcd_cluster_backup_last_schedule_time",
            "Last backup schedule time, unix seconds",
            gauges.backup_last_schedule_time.clone(),
        );
        registry.register(
            "etcd_cluster_backup_last_successful_time",
            "Last backup successful time, unix seconds",
            gauges.backup_last_successful_time.clone(),
        );

        gauges
    }

    fn replica_families(&self) -> [&Family<ClusterLabels, Gauge>; 6] {
        [
            &self.desired_replicas,
            &self.replicas,
            &self.ready_replicas,
            &self.updated_replicas,
            &self.available_replicas,
            &self.learner_replicas,
        ]
    }

    fn backup_families(&self) -> [&Family<ClusterLabels, Gauge>; 2] {
        [
            &self.backup_last_schedule_time,
            &self.backup_last_successful_time,
        ]
    }
}

/// Handle publishing one cluster's observations
pub struct Observer {
    labels: ClusterLabels,
    gauges: Arc<ClusterGauges>,
}

impl Observer {
    /// Publish the latest observed cluster; the next scrape reflects it
    pub fn update(&self, cluster: &EtcdCluster) {
        let status = cluster.status.clone().unwrap_or_default();

        self.gauges
            .desired_replicas
            .get_or_create(&self.labels)
            .set(cluster.spec.replicas as i64);
        self.gauges
            .replicas
            .get_or_create(&self.labels)
            .set(status.replicas as i64);
        self.gauges
            .ready_replicas
            .get_or_create(&self.labels)
            .set(status.ready_replicas as i64);
        self.gauges
            .updated_replicas
            .get_or_create(&self.labels)
            .set(status.updated_replicas as i64);
        self.gauges
            .available_replicas
            .get_or_create(&self.labels)
            .set(status.available_replicas as i64);
        self.gauges
            .learner_replicas
            .get_or_create(&self.labels)
            .set(status.learner_replicas as i64);

        let backup = status.backup.unwrap_or_default();
        self.set_time(
            &self.gauges.backup_last_schedule_time,
            backup.last_schedule_time.as_deref(),
        );
        self.set_time(
            &self.gauges.backup_last_successful_time,
            backup.last_successful_time.as_deref(),
        );
    }

    fn set_time(&self, family: &Family<ClusterLabels, Gauge>, value: Option<&str>) {
        match value.and_then(|ts| DateTime::parse_from_rfc3339(ts).ok()) {
            Some(ts) => {
                family.get_or_create(&self.labels).set(ts.timestamp());
            }
            // no observation, emit nothing
            None => {
                family.remove(&self.labels);
            }
        }
    }

    /// Drop every label set owned by this identity
    pub fn unregister(&self) {
        for family in self.gauges.replica_families() {
            family.remove(&self.labels);
        }
        for family in self.gauges.backup_families() {
            family.remove(&self.labels);
        }
    }
}

/// Registry of observers keyed by cluster identity
pub struct ObserverRegistry {
    gauges: Arc<ClusterGauges>,
    observers: Mutex<HashMap<(String, String), Arc<Observer>>>,
}

impl ObserverRegistry {
    pub fn new(gauges: Arc<ClusterGauges>) -> Self {
        Self {
            gauges,
            observers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_register(&self, cluster: &EtcdCluster) -> Arc<Observer> {
        let key = (
            cluster.namespace().unwrap_or_default(),
            cluster.name_any(),
        );

        let mut observers = self.observers.lock().expect("observer registry lock");
        observers
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Observer {
                    labels: ClusterLabels {
                        namespace: key.0,
                        name: key.1,
                    },
                    gauges: self.gauges.clone(),
                })
            })
            .clone()
    }

    pub fn unregister(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let observer = self.observers.lock().expect("observer registry lock").remove(&key);
        if let Some(observer) = observer {
            observer.unregister();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{BackupStatus, EtcdClusterSpec, EtcdClusterStatus};
    use prometheus_client::encoding::text::encode;

    fn test_cluster(available: i32) -> EtcdCluster {
        let mut cluster = EtcdCluster::new(
            "main",
            serde_json::from_str::<EtcdClusterSpec>(r#"{"replicas": 3}"#).unwrap(),
        );
        cluster.metadata.namespace = Some("etcd-system".to_string());
        cluster.status = Some(EtcdClusterStatus {
            replicas: 3,
            ready_replicas: 3,
            available_replicas: available,
            backup: Some(BackupStatus {
                enabled: true,
                last_schedule_time: Some("2024-06-01T01:00:00Z".to_string()),
                last_successful_time: None,
            }),
            ..Default::default()
        });
        cluster
    }

    #[test]
    fn scrape_reflects_latest_update() {
        let mut registry = Registry::default();
        let gauges = ClusterGauges::register(&mut registry);
        let observers = ObserverRegistry::new(gauges);

        let observer = observers.get_or_register(&test_cluster(2));
        observer.update(&test_cluster(2));
        observer.update(&test_cluster(3));

        let mut output = String::new();
        encode(&mut output, &registry).unwrap();
        assert!(output.contains(
            r#"etcd_cluster_available_replicas{namespace="etcd-system",name="main"} 3"#
        ));
        assert!(output.contains(
            r#"etcd_cluster_backup_last_schedule_time{namespace="etcd-system",name="main"}"#
        ));
        // no successful backup observed yet
        assert!(!output.contains("etcd_cluster_backup_last_successful_time{"));
    }

    #[test]
    fn unregister_removes_all_series() {
        let mut registry = Registry::default();
        let gauges = ClusterGauges::register(&mut registry);
        let observers = ObserverRegistry::new(gauges);

        let cluster = test_cluster(3);
        observers.get_or_register(&cluster).update(&cluster);
        observers.unregister("etcd-system", "main");

        let mut output = String::new();
        encode(&mut output, &registry).unwrap();
        assert!(!output.contains(r#"namespace="etcd-system""#));
    }

    #[test]
    fn register_is_idempotent_per_identity() {
        let mut registry = Registry::default();
        let gauges = ClusterGauges::register(&mut registry);
        let observers = ObserverRegistry::new(gauges);

        let cluster = test_cluster(3);
        let first = observers.get_or_register(&cluster);
        let second = observers.get_or_register(&cluster);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
