//! Per-member lifecycle agent, co-resident with the etcd process.
//!
//! Startup order: wait for the pod IP, serve health, configure the member
//! (credentials, learner admission, config rendering), wait for etcd to be
//! ready, then run the cluster watch and certificate rotation loops until
//! shutdown. Member removal runs after the loops stop, on its own bounded
//! deadline, so a deleted pod still leaves the cluster cleanly.

pub mod configure;
pub mod health;
pub mod pki;
pub mod poll;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use etcd_client::TlsOptions;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::crd::parse_member_id;
use crate::etcd::{self, errors};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("etcd: {0}")]
    Etcd(#[from] crate::etcd::Error),

    #[error("etcd client: {0}")]
    Client(#[from] etcd_client::Error),

    #[error("pki: {0}")]
    Pki(#[from] crate::pki::Error),

    #[error("no valid cluster label found")]
    MissingClusterLabel,

    #[error("pod has no ip address")]
    MissingPodIp,

    #[error("invalid initial-cluster-state")]
    InvalidClusterState,

    #[error("member is not configured yet")]
    NotConfigured,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug)]
pub struct Config {
    pub namespace: String,
    pub name: String,

    pub base_config_file: PathBuf,
    pub config_file: PathBuf,
    pub endpoint: String,
    pub health_address: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub shutdown_timeout: Duration,

    pub prune: bool,
}

/// State shared between configure, the rotation loop and removal.
///
/// Configure runs to completion before the loops start, so writers never
/// overlap with the initial read.
pub(crate) struct State {
    pub etcd_config: RwLock<etcd::Config>,
    pub tls: RwLock<Option<TlsOptions>>,
}

pub struct Sidecar {
    client: kube::Client,
    config: Arc<Config>,
}

impl Sidecar {
    pub fn new(client: kube::Client, config: Config) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub async fn start(self) -> Result<()> {
        let Self { client, config } = self;
        let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);

        // wait for the pod ip, everything downstream needs it
        info!("waiting for pod ip");
        poll::poll(&pods, &config.name, config.interval, |pod: &Pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.pod_ip.as_ref())
                .is_some()
        })
        .await?;

        let state = Arc::new(State {
            etcd_config: RwLock::new(etcd::Config::default()),
            tls: RwLock::new(None),
        });

        // health answers as soon as we are up, reporting whether the config
        // file has been rendered yet
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let health_task = config.health_address.clone().map(|address| {
            tokio::spawn(health::serve(
                address,
                config.config_file.clone(),
                shutdown_rx.clone(),
            ))
        });

        let generator = pki::CredentialGenerator::new(client.clone(), config.clone(), state.clone());

        // configure completes before any loop iteration begins
        configure::configure(&client, &config, &state, &generator).await?;

        // wait until the etcd container is up before watching the cluster
        info!("waiting for etcd container");
        poll::poll(&pods, &config.name, config.interval, |pod: &Pod| {
            pod.status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| statuses.iter().any(|cs| cs.name == "etcd" && cs.ready))
                .unwrap_or(false)
        })
        .await?;

        let result = tokio::select! {
            res = sync::watch_cluster(client.clone(), config.clone(), state.clone()) => res,
            res = rotate_loop(&generator, config.interval) => res,
            _ = shutdown_signal() => {
                info!("received shutdown signal");
                Ok(())
            }
        };
        if let Err(err) = &result {
            error!(error = %err, "sidecar loop failed");
        }

        // graceful removal survives the loop cancellation on its own deadline
        let _ = shutdown_tx.send(true);
        match tokio::time::timeout(
            config.shutdown_timeout,
            remove(&client, &config, &state),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "remove member"),
            Err(_) => error!("remove member timed out"),
        }

        if let Some(task) = health_task {
            let _ = task.await;
        }

        result
    }
}

/// Re-issue credentials periodically; a failed pass is retried on the next
/// tick.
async fn rotate_loop(generator: &pki::CredentialGenerator, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if let Err(err) = generator.generate().await {
            error!(error = %err, "generate credentials");
        }
    }
}

/// Deregister this member when its pod is going away.
///
/// Removal is keyed off the member-id label written during configure; a pod
/// that never joined has nothing to remove.
pub(crate) async fn remove(
    client: &kube::Client,
    config: &Config,
    state: &State,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let pod = pods.get(&config.name).await?;

    // bail if the pod is not being deleted
    if pod.metadata.deletion_timestamp.is_none() {
        return Ok(());
    }

    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let Some(id) = parse_member_id(&labels) else {
        return Ok(());
    };

    let tls = state.tls.read().await.clone().ok_or(Error::NotConfigured)?;
    let mut etcd = etcd::connect(tls, &config.endpoint, config.interval).await?;

    loop {
        match etcd.member_remove(id).await {
            Ok(_) => break,
            Err(err) if errors::is_deadline_exceeded(&err) => {
                info!("remove member: timeout");
            }
            Err(err) if errors::is_unhealthy(&err) => {
                info!("remove member: waiting for cluster to be healthy");
            }
            Err(err) if errors::is_member_not_found(&err) => break,
            Err(err) => return Err(err.into()),
        }

        tokio::time::sleep(config.interval).await;
    }

    info!(id = %crate::crd::format_member_id(id), "removed member");
    Ok(())
}

/// SIGTERM or ctrl-c
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
