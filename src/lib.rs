pub mod backup;
pub mod conditions;
pub mod controller;
pub mod crd;
pub mod etcd;
pub mod health;
pub mod metrics;
pub mod pki;
pub mod resources;
pub mod sidecar;

pub use controller::{error_policy, reconcile, Context, OperatorConfig};
pub use crd::EtcdCluster;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use std::sync::Arc;

/// Run the EtcdCluster controller.
///
/// Watches EtcdCluster resources plus the owned children whose changes feed
/// back into status: the member Deployment, issued Certificates and the
/// maintenance CronJobs. One namespace narrows the watch scope; otherwise the
/// controller is cluster wide. A label selector filters the watched clusters.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    watch_namespace: Option<String>,
    watch_selector: Option<String>,
) {
    tracing::info!("starting controller for EtcdCluster resources");

    let ctx = Arc::new(Context::new(client.clone(), config));

    let clusters: Api<EtcdCluster> = scoped_api(&client, watch_namespace.as_deref());
    let deployments: Api<Deployment> = scoped_api(&client, watch_namespace.as_deref());
    let cron_jobs: Api<CronJob> = scoped_api(&client, watch_namespace.as_deref());
    let certificates: Api<resources::Certificate> = scoped_api(&client, watch_namespace.as_deref());

    let mut cluster_watch = WatcherConfig::default();
    if let Some(selector) = watch_selector {
        cluster_watch = cluster_watch.labels(&selector);
    }
    let owned_watch = WatcherConfig::default();

    Controller::new(clusters, cluster_watch)
        .owns(deployments, owned_watch.clone())
        .owns(cron_jobs, owned_watch.clone())
        .owns(certificates, owned_watch)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!(name = %obj.name, "reconciled");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "reconciliation error");
                }
            }
        })
        .await;

    tracing::error!("controller stream ended unexpectedly");
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}
