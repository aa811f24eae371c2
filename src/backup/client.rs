//! S3 client construction and backup object listing.

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};

use super::{parse_key, Error, Result};

/// Build an S3 client from the ambient AWS_* environment.
///
/// Path-style addressing keeps S3-compatible stores (MinIO and friends)
/// working.
pub async fn new_client() -> Client {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let s3_config = aws_sdk_s3::config::Builder::from(&config)
        .force_path_style(true)
        .build();

    Client::from_conf(s3_config)
}

/// A backup object whose key basename parses as a backup timestamp
#[derive(Clone, Debug, PartialEq)]
pub struct BackupObject {
    pub key: String,
    /// Timestamp parsed from the key basename
    pub timestamp: DateTime<Utc>,
    /// Store-side modification time, used only for retention tagging
    pub last_modified: Option<DateTime<Utc>>,
}

/// Find the latest backup under a prefix.
///
/// Pages through the listing with continuation tokens; ordering is decided by
/// the timestamp parsed from the key name, which is deterministic and
/// independent of store-side clocks. Keys that do not parse are skipped.
pub async fn latest_backup(
    client: &Client,
    bucket: &str,
    prefix: &str,
) -> Result<Option<BackupObject>> {
    let mut latest: Option<BackupObject> = None;
    let mut token: Option<String> = None;

    loop {
        let resp = client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .set_continuation_token(token.take())
            .send()
            .await
            .map_err(|err| Error::Storage(err.to_string()))?;

        for object in resp.contents() {
            let Some(key) = object.key() else {
                continue;
            };
            let name = key.rsplit('/').next().unwrap_or(key);
            let Some(timestamp) = parse_key(name) else {
                continue;
            };

            let last_modified = object
                .last_modified()
                .and_then(|ts| DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()));

            if latest.as_ref().map_or(true, |cur| timestamp > cur.timestamp) {
                latest = Some(BackupObject {
                    key: key.to_string(),
                    timestamp,
                    last_modified,
                });
            }
        }

        token = resp.next_continuation_token().map(str::to_string);
        if token.is_none() {
            return Ok(latest);
        }
    }
}
