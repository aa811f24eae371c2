//! Shared state for the EtcdCluster controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::crd::EtcdCluster;
use crate::etcd::TlsCache;

use super::error::RetryTracker;

/// Process-scoped configuration, constructed once at startup
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// etcd image repository; the cluster version is the tag
    pub image: String,
    /// Image carrying the sidecar and tools binaries
    pub controller_image: String,
    pub priority_class_name: Option<String>,
    /// Captured AWS_* environment; empty disables the backup subsystem
    pub backup_env: BTreeMap<String, String>,
}

impl OperatorConfig {
    pub fn backup_configured(&self) -> bool {
        !self.backup_env.is_empty()
    }
}

/// Shared context handed to every reconcile invocation
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
    pub tls_cache: Arc<TlsCache>,
    pub retries: Arc<RetryTracker>,
    reporter: Reporter,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        let tls_cache = Arc::new(TlsCache::new(client.clone(), 64));
        Self {
            client,
            config,
            tls_cache,
            retries: Arc::new(RetryTracker::default()),
            reporter: Reporter {
                controller: "etcdcluster".into(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }

    /// Record a phase transition event on the cluster
    pub async fn publish_transition(&self, cluster: &EtcdCluster, from: &str, to: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let event = Event {
            type_: EventType::Normal,
            reason: to.to_string(),
            note: Some(format!("Transition from {from} to {to}")),
            action: "Transition".to_string(),
            secondary: None,
        };

        if let Err(err) = recorder.publish(&event, &cluster.object_ref(&())).await {
            tracing::warn!(error = %err, "publish transition event");
        }
    }
}
