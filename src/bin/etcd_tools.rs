use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use etcd_operator::backup::{self, BackupParams, DefragParams, RestoreParams};
use etcd_operator::controller::spec::parse_quantity;
use etcd_operator::etcd::{self, Credentials};

const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Maintenance jobs for etcd clusters
#[derive(Parser, Debug)]
#[command(name = "etcd-tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backup cluster to object storage
    Backup {
        /// etcd endpoint
        #[arg(long)]
        endpoint: String,

        /// etcd credentials directory
        #[arg(long)]
        credentials_dir: PathBuf,

        /// Object key; derived from the prefix when unset
        #[arg(long)]
        key: Option<String>,

        /// Object prefix
        #[arg(long, default_value = "")]
        prefix: String,

        /// Object retention
        #[arg(long, value_parser = humantime::parse_duration)]
        retention: Option<Duration>,
    },

    /// Restore the data directory from a bucket object.
    ///
    /// When a prefix is given the latest backup under it is used.
    Restore {
        /// etcd config file path
        #[arg(long, required = true)]
        config: PathBuf,

        /// Backup object key
        #[arg(long)]
        key: Option<String>,

        /// Backup object prefix to search for the latest backup
        #[arg(long)]
        prefix: Option<String>,
    },

    /// Defragment cluster members
    Defrag {
        /// etcd endpoint
        #[arg(long)]
        endpoint: String,

        /// etcd credentials directory
        #[arg(long)]
        credentials_dir: PathBuf,

        /// Threshold ratio of unused space
        #[arg(long, default_value_t = 0.7)]
        unused_ratio: f64,

        /// Threshold size of unused space
        #[arg(long, default_value = "128M")]
        unused_size: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("etcd_operator=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Backup {
            endpoint,
            credentials_dir,
            key,
            prefix,
            retention,
        } => {
            let tls = Credentials::load_dir(&credentials_dir)?.tls_options()?;
            let mut client = etcd::connect(tls, &endpoint, OPERATION_TIMEOUT).await?;

            let storage = backup::new_client().await;
            let bucket = bucket_from_env()?;

            backup::backup(
                &mut client,
                &storage,
                BackupParams {
                    bucket,
                    key,
                    prefix,
                    retention,
                },
            )
            .await?;
        }

        Command::Restore {
            config,
            key,
            prefix,
        } => {
            if key.is_some() == prefix.is_some() {
                anyhow::bail!("either --prefix or --key have to be specified");
            }

            let config = etcd::Config::load(&config)?;
            let storage = backup::new_client().await;
            let bucket = bucket_from_env()?;

            backup::restore(&storage, &config, RestoreParams { bucket, key, prefix }).await?;
        }

        Command::Defrag {
            endpoint,
            credentials_dir,
            unused_ratio,
            unused_size,
        } => {
            let tls = Credentials::load_dir(&credentials_dir)?.tls_options()?;
            let mut client = etcd::connect(tls.clone(), &endpoint, OPERATION_TIMEOUT).await?;

            let unused_size = parse_quantity(&unused_size)
                .ok_or_else(|| anyhow::anyhow!("invalid --unused-size {unused_size:?}"))?;

            backup::defrag(
                &mut client,
                tls,
                OPERATION_TIMEOUT,
                DefragParams {
                    ratio: unused_ratio,
                    unused_size,
                },
            )
            .await?;
        }
    }

    Ok(())
}

fn bucket_from_env() -> anyhow::Result<String> {
    std::env::var("AWS_BUCKET_NAME").map_err(|_| anyhow::anyhow!("AWS_BUCKET_NAME is required"))
}
