//! Independent reconcile loop keeping the observer registry in sync with the
//! set of live clusters.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Config};
use kube::runtime::watcher;
use kube::runtime::Controller;
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::crd::EtcdCluster;

use super::observer::ObserverRegistry;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
}

pub struct MetricsContext {
    pub client: kube::Client,
    pub registry: ObserverRegistry,
}

/// Keep gauges for live clusters, drop them for deleted ones
pub async fn reconcile(
    cluster: Arc<EtcdCluster>,
    ctx: Arc<MetricsContext>,
) -> Result<Action, ReconcileError> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    // read back through the api so deletion is observed even when the event
    // that woke us is stale
    let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let current = api.get_opt(&name).await?;

    match current {
        Some(cluster) if cluster.metadata.deletion_timestamp.is_none() => {
            ctx.registry.get_or_register(&cluster).update(&cluster);
        }
        _ => {
            debug!(%namespace, %name, "cluster gone, dropping gauges");
            ctx.registry.unregister(&namespace, &name);
        }
    }

    Ok(Action::await_change())
}

pub fn error_policy(
    cluster: Arc<EtcdCluster>,
    error: &ReconcileError,
    _ctx: Arc<MetricsContext>,
) -> Action {
    warn!(name = %cluster.name_any(), %error, "metrics reconcile failed");
    Action::requeue(Duration::from_secs(5))
}

/// Run the metrics controller on the shared cluster event stream with up to
/// four concurrent reconciles across identities.
pub async fn run_metrics_controller(client: kube::Client, registry: ObserverRegistry) {
    let clusters: Api<EtcdCluster> = Api::all(client.clone());
    let ctx = Arc::new(MetricsContext { client, registry });

    Controller::new(clusters, watcher::Config::default())
        .with_config(Config::default().concurrency(4))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            if let Err(err) = result {
                warn!(error = %err, "metrics reconciliation error");
            }
        })
        .await;
}
