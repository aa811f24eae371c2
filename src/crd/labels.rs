//! Pod labels and annotations used as the source of truth for membership
//! mapping between pods and etcd members.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

pub const CLUSTER_LABEL: &str = "etcd.fleet.example.com/cluster";
pub const MEMBER_ID_LABEL: &str = "etcd.fleet.example.com/member-id";
pub const LEARNER_LABEL: &str = "etcd.fleet.example.com/learner";

pub const RENEW_AT_ANNOTATION: &str = "etcd.fleet.example.com/renew-at";

/// Cluster identity carried on pod labels: `<name>.<namespace>`
pub fn cluster_label_value(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

/// Resolve the cluster (name, namespace) from pod labels
pub fn parse_cluster(labels: &BTreeMap<String, String>) -> Option<(String, String)> {
    let value = labels.get(CLUSTER_LABEL)?;
    let (name, namespace) = value.split_once('.')?;
    if name.is_empty() || namespace.is_empty() {
        return None;
    }

    Some((name.to_string(), namespace.to_string()))
}

pub fn format_member_id(id: u64) -> String {
    format!("{id:x}")
}

pub fn parse_member_id(labels: &BTreeMap<String, String>) -> Option<u64> {
    let value = labels.get(MEMBER_ID_LABEL)?;
    u64::from_str_radix(value, 16).ok()
}

pub fn format_renew_at(renew_at: DateTime<Utc>) -> String {
    renew_at.to_rfc3339()
}

pub fn parse_renew_at(annotations: &BTreeMap<String, String>) -> Option<DateTime<Utc>> {
    let value = annotations.get(RENEW_AT_ANNOTATION)?;
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cluster_label_round_trip() {
        let mut labels = BTreeMap::new();
        labels.insert(
            CLUSTER_LABEL.to_string(),
            cluster_label_value("main", "etcd-system"),
        );

        let (name, namespace) = parse_cluster(&labels).unwrap();
        assert_eq!(name, "main");
        assert_eq!(namespace, "etcd-system");
    }

    #[test]
    fn cluster_label_rejects_malformed() {
        let mut labels = BTreeMap::new();
        labels.insert(CLUSTER_LABEL.to_string(), "no-namespace".to_string());
        assert!(parse_cluster(&labels).is_none());

        labels.insert(CLUSTER_LABEL.to_string(), ".".to_string());
        assert!(parse_cluster(&labels).is_none());
    }

    #[test]
    fn member_id_hex_round_trip() {
        let id = 0x8e9e05c52164694du64;
        assert_eq!(format_member_id(id), "8e9e05c52164694d");

        let mut labels = BTreeMap::new();
        labels.insert(MEMBER_ID_LABEL.to_string(), format_member_id(id));
        assert_eq!(parse_member_id(&labels), Some(id));
    }

    #[test]
    fn member_id_missing_or_invalid() {
        let labels = BTreeMap::new();
        assert_eq!(parse_member_id(&labels), None);

        let mut labels = BTreeMap::new();
        labels.insert(MEMBER_ID_LABEL.to_string(), "not-hex!".to_string());
        assert_eq!(parse_member_id(&labels), None);
    }

    #[test]
    fn renew_at_round_trip() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();

        let mut annotations = BTreeMap::new();
        annotations.insert(RENEW_AT_ANNOTATION.to_string(), format_renew_at(ts));
        assert_eq!(parse_renew_at(&annotations), Some(ts));
    }
}
