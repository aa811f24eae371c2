use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tracing::{error, info, warn};

use etcd_operator::health::{run_health_server, HealthState};
use etcd_operator::metrics::{run_metrics_controller, ObserverRegistry};
use etcd_operator::sidecar::shutdown_signal;
use etcd_operator::{backup, run_controller, OperatorConfig};

const LEASE_NAME: &str = "etcd-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

const DEFAULT_IMAGE: &str = "quay.io/coreos/etcd";
const DEFAULT_CONTROLLER_IMAGE: &str = "ghcr.io/example/etcd-operator";

/// Operator for fleets of etcd clusters
#[derive(Parser, Debug)]
#[command(name = "etcd-operator", version)]
struct Args {
    /// The address the metric endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: String,

    /// Enable leader election; ensures only one active operator
    #[arg(long)]
    leader_elect: bool,

    /// Namespace to watch for resources; empty watches everywhere
    #[arg(long, env = "POD_NAMESPACE")]
    watch_namespaces: Option<String>,

    /// Label selector filtering watched clusters
    #[arg(long)]
    watch_selector: Option<String>,

    /// Cluster pods priorityClassName
    #[arg(long)]
    priority_class_name: Option<String>,

    /// etcd image repository; the cluster version is the tag
    #[arg(long, default_value = DEFAULT_IMAGE)]
    image: String,

    /// Image carrying the sidecar and tools binaries
    #[arg(long, default_value = DEFAULT_CONTROLLER_IMAGE)]
    controller_image: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("etcd_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    info!("starting etcd-operator");

    let client = Client::try_default().await?;
    info!("connected to kubernetes cluster");

    let backup_env: BTreeMap<String, String> = backup::load_env();
    if backup_env.is_empty() {
        warn!("backup environment not configured, backups are disabled");
    }

    let config = OperatorConfig {
        image: args.image,
        controller_image: args.controller_image,
        priority_class_name: args.priority_class_name,
        backup_env,
    };

    let health_state = Arc::new(HealthState::new());

    // probes answer immediately, readiness flips once the controllers run
    let health_handle = {
        let health_state = health_state.clone();
        let metrics_address = args.metrics_bind_address.clone();
        let probe_address = args.health_probe_bind_address.clone();
        tokio::spawn(async move {
            if let Err(err) = run_health_server(health_state, metrics_address, probe_address).await
            {
                error!(error = %err, "health server");
            }
        })
    };

    if args.leader_elect {
        acquire_leadership(&client).await;
    }

    let watch_namespace = args
        .watch_namespaces
        .clone()
        .filter(|ns| !ns.is_empty());

    info!("watching EtcdCluster resources (apiVersion: etcd.fleet.example.com/v1)");

    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        let selector = args.watch_selector.clone();
        let namespace = watch_namespace.clone();
        tokio::spawn(async move {
            run_controller(client, config, namespace, selector).await;
        })
    };

    let metrics_handle = {
        let client = client.clone();
        let registry = ObserverRegistry::new(health_state.gauges());
        tokio::spawn(async move {
            run_metrics_controller(client, registry).await;
        })
    };

    health_state.set_ready(true).await;

    tokio::select! {
        result = controller_handle => {
            if let Err(err) = result {
                error!(error = %err, "cluster controller task panicked");
            }
        }
        result = metrics_handle => {
            if let Err(err) = result {
                error!(error = %err, "metrics controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(err) = result {
                error!(error = %err, "health server task panicked");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, initiating graceful shutdown");

            health_state.set_ready(false).await;
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;
        }
    }

    info!("operator stopped");
    Ok(())
}

/// Block until this instance holds the leader lease, then keep renewing it
/// in the background. Lost leadership exits the process so the next start
/// re-enters the election.
async fn acquire_leadership(client: &Client) {
    let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "etcd-operator".to_string())
    });
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());

    let params = || LeaseLockParams {
        holder_id: holder.clone(),
        lease_name: LEASE_NAME.to_string(),
        lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
    };
    let lease_lock = LeaseLock::new(client.clone(), &namespace, params());

    info!(holder_id = %holder, %namespace, lease = LEASE_NAME, "waiting to acquire leadership");
    loop {
        match lease_lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("acquired leadership");
                break;
            }
            Ok(_) => info!("another instance is leader, waiting"),
            Err(err) => warn!(error = %err, "failed to acquire lease, retrying"),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }

    let renewal_lock = LeaseLock::new(client.clone(), &namespace, params());
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;

            match renewal_lock.try_acquire_or_renew().await {
                Ok(result) if !result.acquired_lease => {
                    error!("lost leadership, shutting down");
                    std::process::exit(1);
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "failed to renew lease, shutting down");
                    std::process::exit(1);
                }
            }
        }
    });
}
