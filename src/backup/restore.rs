//! Seed a member's data directory from a snapshot object.

use std::io::Read;
use std::path::Path;

use aws_sdk_s3::Client;
use flate2::read::GzDecoder;
use tracing::info;

use crate::etcd::{Config, InitialState};

use super::{latest_backup, snapshot::tempdir, Error, Result};

#[derive(Clone, Debug, Default)]
pub struct RestoreParams {
    pub bucket: String,
    pub key: Option<String>,
    pub prefix: Option<String>,
}

/// Restore the data directory described by the rendered etcd config.
///
/// Only meaningful for a fresh cluster; an `existing` initial state means the
/// member will sync from its peers instead.
pub async fn restore(client: &Client, config: &Config, params: RestoreParams) -> Result<()> {
    if params.bucket.is_empty() {
        return Err(Error::InvalidLocation);
    }

    if config.initial_cluster_state != Some(InitialState::New) {
        info!("skipping restore for existing cluster");
        return Ok(());
    }

    // no explicit key - latest backup under the prefix wins
    let key = match (&params.key, &params.prefix) {
        (Some(key), _) => key.clone(),
        (None, Some(prefix)) => match latest_backup(client, &params.bucket, prefix).await? {
            Some(object) => {
                info!(key = %object.key, "using latest backup");
                object.key
            }
            None => return Err(Error::BackupNotFound),
        },
        (None, None) => return Err(Error::InvalidLocation),
    };

    let dir = tempdir("restore")?;
    let compressed = dir.join("snapshot.tar.gz");
    download_snapshot(client, &params.bucket, &key, &compressed).await?;
    info!(bucket = %params.bucket, %key, "downloaded snapshot");

    let decompressed = dir.join("snapshot.db");
    decompress_snapshot(&compressed, &decompressed)?;
    info!("decompressed snapshot");

    restore_data_dir(config, &decompressed).await?;
    info!(data_dir = %config.data_dir, "restored from snapshot");

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

pub async fn download_snapshot(
    client: &Client,
    bucket: &str,
    key: &str,
    target: &Path,
) -> Result<()> {
    let resp = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|err| Error::Storage(err.to_string()))?;

    let data = resp
        .body
        .collect()
        .await
        .map_err(|err| Error::Storage(err.to_string()))?;
    std::fs::write(target, data.into_bytes())?;

    Ok(())
}

/// Extract the `snapshot.db` entry from the archive
pub fn decompress_snapshot(source: &Path, target: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(std::fs::File::open(source)?));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?;
        if path.as_ref() != Path::new("snapshot.db") {
            continue;
        }

        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        std::fs::write(target, data)?;
        return Ok(());
    }

    Err(Error::MissingSnapshotEntry)
}

/// Rebuild the data directory with etcdutl; the snapshot format itself is
/// opaque here.
async fn restore_data_dir(config: &Config, snapshot: &Path) -> Result<()> {
    let output = tokio::process::Command::new("etcdutl")
        .arg("snapshot")
        .arg("restore")
        .arg(snapshot)
        .arg("--name")
        .arg(&config.name)
        .arg("--data-dir")
        .arg(&config.data_dir)
        .arg("--initial-cluster")
        .arg(&config.initial_cluster)
        .arg("--initial-cluster-token")
        .arg(&config.initial_cluster_token)
        .arg("--initial-advertise-peer-urls")
        .arg(&config.initial_advertise_peer_urls)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::Restore(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::snapshot::compress;

    #[test]
    fn decompress_extracts_snapshot() {
        let dir = tempdir("decompress-test").unwrap();
        let source = dir.join("snapshot.db");
        std::fs::write(&source, b"backend bytes").unwrap();
        let archive = dir.join("snapshot.tar.gz");
        compress(&source, &archive).unwrap();

        let target = dir.join("restored.db");
        decompress_snapshot(&archive, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"backend bytes");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn decompress_requires_snapshot_entry() {
        let dir = tempdir("decompress-miss").unwrap();
        let source = dir.join("other.db");
        std::fs::write(&source, b"bytes").unwrap();

        // archive with a different entry name
        let archive_path = dir.join("other.tar.gz");
        let file = std::fs::File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut source_file = std::fs::File::open(&source).unwrap();
        builder.append_file("other.db", &mut source_file).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let target = dir.join("restored.db");
        let err = decompress_snapshot(&archive_path, &target).unwrap_err();
        assert!(matches!(err, Error::MissingSnapshotEntry));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
