use chrono::Utc;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::conditions::{Condition, Upsertable};

/// EtcdCluster is the Schema for the etcdclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "etcd.fleet.example.com",
    version = "v1",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "ec",
    namespaced,
    status = "EtcdClusterStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Available", "type":"integer", "jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Updated", "type":"integer", "jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Number of cluster members
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// etcd version, used as the image tag (e.g. "v3.5.14")
    #[serde(default = "default_version")]
    pub version: String,

    /// Labels propagated to every child resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common_labels: BTreeMap<String, String>,

    /// Annotations propagated to every child resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common_annotations: BTreeMap<String, String>,

    /// Seed the data directory from an object storage snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,

    /// Periodic snapshot upload to object storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Periodic member defragmentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defrag: Option<DefragSpec>,

    /// Pause suspends resource rendering; status is still reported
    #[serde(default)]
    pub pause: bool,

    /// Pod priority class for cluster members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Pod runtime class for cluster members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_class_name: Option<String>,

    /// Size limit on the member data volume (e.g. "4G")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_quota: Option<String>,

    /// Compute resources for each member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra metadata for member pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplateSpec>,
}

fn default_replicas() -> i32 {
    1
}

fn default_version() -> String {
    "v3.5.14".to_string()
}

/// Restore configuration: seed a new cluster from a snapshot object.
///
/// When `key` is unset the latest backup under `prefix` is used
/// (`<namespace>/<name>` by default).
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Backup schedule configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Cron schedule, hourly by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Suspend the backup cron job without deleting it
    #[serde(default)]
    pub suspend: bool,
}

/// Defrag schedule configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DefragSpec {
    /// Cron schedule, daily by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Suspend the defrag cron job without deleting it
    #[serde(default)]
    pub suspend: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<DefragThreshold>,
}

/// Skip defragmentation below these unused-space thresholds
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct DefragThreshold {
    /// Unused size threshold (e.g. "128M")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// In-use to total size ratio threshold, 0.0 - 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratio: Option<f64>,
}

/// Compute resources for member pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// Extra pod metadata merged into member pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Observed state of an EtcdCluster
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Lifecycle phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ClusterPhase>,

    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupStatus>,

    /// Number of non-terminated member pods
    #[serde(default)]
    pub replicas: i32,

    /// Number of ready member pods
    #[serde(default)]
    pub ready_replicas: i32,

    /// Number of fully provisioned members
    #[serde(default)]
    pub available_replicas: i32,

    #[serde(default)]
    pub learner_replicas: i32,

    /// Number of members synced with the cluster spec
    #[serde(default)]
    pub updated_replicas: i32,

    /// Observed etcd version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Client endpoint, assigned once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the secret holding the root user client certificate, assigned once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<MemberStatus>,
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// First member is starting with a fresh cluster token
    Bootstrap,
    /// Cluster reached at least one available member
    Running,
    /// Cluster lost all members while running; terminal
    Failed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Bootstrap => write!(f, "Bootstrap"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Role of a member within the raft group
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum MemberRole {
    Leader,
    Member,
    Learner,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

impl MemberRole {
    /// Sort rank: leader first, unstarted members last
    pub fn order(self) -> usize {
        match self {
            MemberRole::Leader => 0,
            MemberRole::Member => 1,
            MemberRole::Learner => 2,
            MemberRole::Unspecified => 3,
        }
    }
}

/// Observed state of a single cluster member
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Member ID, hex-formatted
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,

    #[serde(default)]
    pub available: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MemberRole>,

    /// Backend database size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl MemberStatus {
    pub fn role(&self) -> MemberRole {
        self.role.unwrap_or_default()
    }
}

/// Backup subsystem status, mirrored from the backup cron job
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_time: Option<String>,
}

/// Condition status values following Kubernetes conventions
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// Known condition types
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum ClusterConditionType {
    Available,
    Scaling,
    Upgrading,
    Backup,
    Restore,
}

/// Latest service state of a cluster, one entry per condition type
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ClusterCondition {
    pub fn new(type_: ClusterConditionType, status: ConditionStatus) -> Self {
        Self {
            type_,
            status,
            last_transition_time: None,
            reason: String::new(),
            message: String::new(),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl Condition for ClusterCondition {
    type Type = ClusterConditionType;

    fn type_(&self) -> ClusterConditionType {
        self.type_
    }

    fn status(&self) -> ConditionStatus {
        self.status
    }
}

impl Upsertable for ClusterCondition {
    fn matches(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }

    fn touch(mut self) -> Self {
        if self.last_transition_time.is_none() {
            self.last_transition_time = Some(Utc::now().to_rfc3339());
        }
        self
    }
}

impl EtcdCluster {
    /// Phase accessor; unset status counts as unset phase
    pub fn phase(&self) -> Option<ClusterPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::Upsertable;

    #[test]
    fn condition_matches_ignores_transition_time() {
        let a = ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::True)
            .reason("ClusterAvailable");
        let mut b = a.clone();
        b.last_transition_time = Some("2024-01-01T00:00:00Z".to_string());

        assert!(a.matches(&b));
    }

    #[test]
    fn condition_touch_preserves_existing_time() {
        let cond = ClusterCondition {
            type_: ClusterConditionType::Backup,
            status: ConditionStatus::False,
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: "BackupNotConfigured".to_string(),
            message: String::new(),
        };

        let touched = cond.clone().touch();
        assert_eq!(touched.last_transition_time, cond.last_transition_time);
    }

    #[test]
    fn condition_touch_fills_missing_time() {
        let cond = ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::True);
        assert!(cond.touch().last_transition_time.is_some());
    }

    #[test]
    fn member_role_order() {
        assert!(MemberRole::Leader.order() < MemberRole::Member.order());
        assert!(MemberRole::Member.order() < MemberRole::Learner.order());
        assert!(MemberRole::Learner.order() < MemberRole::Unspecified.order());
    }

    #[test]
    fn condition_type_serializes_as_type() {
        let cond = ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::True)
            .reason("ClusterAvailable");
        let value = serde_json::to_value(&cond).unwrap();
        assert_eq!(value["type"], "Available");
        assert_eq!(value["status"], "True");
    }

    #[test]
    fn spec_defaults() {
        let spec: EtcdClusterSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.version, "v3.5.14");
        assert!(!spec.pause);
    }
}
