//! Snapshot backup and restore through S3-compatible object storage.

pub mod client;
pub mod defrag;
pub mod restore;
pub mod snapshot;

pub use client::{latest_backup, new_client, BackupObject};
pub use defrag::{defrag, DefragParams};
pub use restore::{restore, RestoreParams};
pub use snapshot::{backup, BackupParams};

use std::collections::BTreeMap;

use thiserror::Error;

/// Object key timestamp format, always UTC. Keys sort lexicographically in
/// timestamp order.
pub const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

/// Environment required for the backup subsystem; missing any entry disables
/// backups globally.
pub const REQUIRED_ENV: [&str; 4] = [
    "AWS_DEFAULT_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_BUCKET_NAME",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("location: bucket and key are required")]
    InvalidLocation,

    #[error("backup not found")]
    BackupNotFound,

    #[error("etcd client: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("object storage: {0}")]
    Storage(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive does not contain snapshot.db")]
    MissingSnapshotEntry,

    #[error("snapshot restore: {0}")]
    Restore(String),

    #[error("defrag: {0}")]
    Defrag(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Capture the AWS_* environment, empty when any required variable is absent
pub fn load_env() -> BTreeMap<String, String> {
    let env: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, _)| key.starts_with("AWS_"))
        .collect();

    if REQUIRED_ENV.iter().any(|key| !env.contains_key(*key)) {
        return BTreeMap::new();
    }

    env
}

/// Format a timestamp as an object key basename
pub fn format_key(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format(DATE_FORMAT).to_string()
}

/// Parse an object key basename back into a timestamp
pub fn parse_key(name: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::{NaiveDateTime, TimeZone, Utc};

    let naive = NaiveDateTime::parse_from_str(name, DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn key_format_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 13, 45, 9).unwrap();
        let key = format_key(ts);
        assert_eq!(key, "20240601134509");
        assert_eq!(parse_key(&key), Some(ts));
    }

    #[test]
    fn parse_key_rejects_non_timestamps() {
        assert!(parse_key("snapshot.tar.gz").is_none());
        assert!(parse_key("2024").is_none());
        assert!(parse_key("").is_none());
    }

    #[test]
    fn keys_sort_lexicographically_by_time() {
        let earlier = format_key(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let later = format_key(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 1).unwrap());
        assert!(earlier < later);
    }
}
