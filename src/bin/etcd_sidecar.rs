use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::Client;
use tracing::error;

use etcd_operator::sidecar::{Config, Sidecar};

/// etcd member lifecycle sidecar
#[derive(Parser, Debug)]
#[command(name = "etcd-sidecar", version)]
struct Args {
    /// Base etcd cluster config file
    #[arg(long, required = true)]
    base_config: PathBuf,

    /// Output path for the generated config file
    #[arg(long, required = true)]
    config: PathBuf,

    /// etcd cluster endpoint
    #[arg(long, default_value = "https://127.0.0.1:2379")]
    endpoint: String,

    /// The address the health endpoint binds to
    #[arg(long)]
    health_address: Option<String>,

    /// Operation retry interval
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Operation timeout
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Shutdown timeout
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    /// Prune members without pods
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    prune: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("etcd_operator=info".parse()?),
        )
        .init();

    let namespace = std::env::var("POD_NAMESPACE").ok();
    let name = std::env::var("POD_NAME").ok();
    let (Some(namespace), Some(name)) = (namespace, name) else {
        anyhow::bail!("POD_NAMESPACE and POD_NAME are required");
    };

    let config = Config {
        namespace,
        name,
        base_config_file: args.base_config,
        config_file: args.config,
        endpoint: args.endpoint,
        health_address: args.health_address,
        interval: args.interval,
        timeout: args.timeout,
        shutdown_timeout: args.shutdown_timeout,
        prune: args.prune,
    };

    let client = Client::try_default().await?;

    if let Err(err) = Sidecar::new(client, config).start().await {
        error!(error = %err, "sidecar");
        return Err(err.into());
    }

    Ok(())
}
