pub mod etcd_cluster;
pub mod labels;

pub use etcd_cluster::{
    BackupSpec, BackupStatus, ClusterCondition, ClusterConditionType, ClusterPhase, ConditionStatus,
    DefragSpec, DefragThreshold, EtcdCluster, EtcdClusterSpec, EtcdClusterStatus, MemberRole,
    MemberStatus, PodTemplateSpec, ResourceList, ResourceRequirements, RestoreSpec,
};
pub use labels::{
    cluster_label_value, format_member_id, format_renew_at, parse_cluster, parse_member_id,
    parse_renew_at, CLUSTER_LABEL, LEARNER_LABEL, MEMBER_ID_LABEL, RENEW_AT_ANNOTATION,
};
