//! Cluster snapshot capture and upload.

use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::{Local, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use super::{format_key, latest_backup, Error, Result};

/// Retention tag values applied to uploaded snapshots
pub const TAG_HOURLY: &str = "Hourly";
pub const TAG_DAILY: &str = "Daily";

#[derive(Clone, Debug, Default)]
pub struct BackupParams {
    pub bucket: String,
    /// Explicit object key; derived from `prefix` and the current time when
    /// unset
    pub key: Option<String>,
    pub prefix: String,
    /// Optional object expiry
    pub retention: Option<Duration>,
}

/// Snapshot the cluster and upload the archive.
///
/// The first backup after local midnight is tagged `Backup=Daily` so store
/// lifecycle rules can retain dailies longer than hourlies.
pub async fn backup(
    etcd: &mut etcd_client::Client,
    client: &Client,
    params: BackupParams,
) -> Result<()> {
    if params.bucket.is_empty() {
        return Err(Error::InvalidLocation);
    }

    let key = match &params.key {
        Some(key) => key.clone(),
        None if params.prefix.is_empty() => return Err(Error::InvalidLocation),
        None => format!("{}/{}", params.prefix, format_key(Utc::now())),
    };

    let dir = tempdir("backup")?;
    let uncompressed = dir.join("snapshot.db");
    save_snapshot(etcd, &uncompressed).await?;
    info!(target = %uncompressed.display(), "saved snapshot");

    let compressed = dir.join("snapshot.tar.gz");
    compress(&uncompressed, &compressed)?;
    info!(target = %compressed.display(), "compressed snapshot");

    let tag = match latest_backup(client, &params.bucket, &params.prefix).await? {
        None => TAG_DAILY,
        Some(object) => {
            let midnight = Local::now().date_naive().and_hms_opt(0, 0, 0).map(|naive| {
                Local
                    .from_local_datetime(&naive)
                    .earliest()
                    .unwrap_or_else(Local::now)
            });
            let stale = match (object.last_modified, midnight) {
                (Some(modified), Some(midnight)) => modified.with_timezone(&Local) < midnight,
                _ => false,
            };
            if stale {
                TAG_DAILY
            } else {
                TAG_HOURLY
            }
        }
    };

    let body = ByteStream::from_path(&compressed)
        .await
        .map_err(|err| Error::Storage(err.to_string()))?;

    let mut request = client
        .put_object()
        .bucket(&params.bucket)
        .key(&key)
        .tagging(format!("Backup={tag}"))
        .body(body);
    if let Some(retention) = params.retention {
        let expires = std::time::SystemTime::now() + retention;
        request = request.expires(expires.into());
    }

    request
        .send()
        .await
        .map_err(|err| Error::Storage(err.to_string()))?;

    info!(bucket = %params.bucket, %key, tag, "uploaded snapshot");

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

/// Stream the member snapshot into a file
pub async fn save_snapshot(etcd: &mut etcd_client::Client, target: &Path) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(target)?;
    let mut stream = etcd.snapshot().await?;
    while let Some(resp) = stream.message().await? {
        file.write_all(resp.blob())?;
    }
    file.flush()?;

    Ok(())
}

/// Wrap the raw snapshot into the tar+gzip archive layout
pub fn compress(source: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::create(target)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut archive = tar::Builder::new(encoder);

    let mut source_file = std::fs::File::open(source)?;
    archive.append_file("snapshot.db", &mut source_file)?;
    archive.into_inner()?.finish()?;

    Ok(())
}

pub(super) fn tempdir(label: &str) -> Result<std::path::PathBuf> {
    let dir = std::env::temp_dir().join(format!("{label}.{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn archive_contains_snapshot_db() {
        let dir = tempdir("compress-test").unwrap();
        let source = dir.join("snapshot.db");
        std::fs::write(&source, b"backend bytes").unwrap();

        let target = dir.join("snapshot.tar.gz");
        compress(&source, &target).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(std::fs::File::open(&target).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                entry
                    .unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        assert_eq!(names, vec!["snapshot.db"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
