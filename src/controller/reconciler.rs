//! Reconciliation of EtcdCluster resources: desired-state rendering, phase
//! transitions and status reporting.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::backup;
use crate::conditions;
use crate::crd::{
    cluster_label_value, BackupStatus, ClusterCondition, ClusterConditionType, ClusterPhase,
    ConditionStatus, EtcdCluster, EtcdClusterStatus, MemberRole, MemberStatus, CLUSTER_LABEL,
};
use crate::etcd;
use crate::resources::{Builder, KeyUsage};

use super::context::Context;
use super::error::{Error, Result};
use super::spec;

const MEMBER_LIST_TIMEOUT: Duration = Duration::from_secs(30);
const MEMBER_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_REFRESH: Duration = Duration::from_secs(60);

/// Main reconcile entry point, at most one invocation per cluster identity
#[instrument(skip(cluster, ctx), fields(namespace = %cluster.namespace().unwrap_or_default(), name = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<EtcdCluster>, ctx: Arc<Context>) -> Result<Action> {
    let key = reconcile_key(&cluster);
    debug!("reconciling cluster");

    // terminal phase, nothing left to manage
    if cluster.phase() == Some(ClusterPhase::Failed) {
        return Ok(Action::await_change());
    }

    let mut cluster = (*cluster).clone();
    let base_status = cluster.status.clone();

    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let status = status_mut(&mut cluster);
    if status.phase.is_none() {
        status.phase = Some(ClusterPhase::Bootstrap);
    }
    if status.secret_name.is_none() {
        status.secret_name = Some(format!("{name}-user-root"));
    }
    if status.endpoint.is_none() {
        status.endpoint = Some(format!("https://{name}.{namespace}.svc.cluster.local:2379"));
    }

    reconcile_resources(&mut cluster, &ctx).await?;
    reconcile_status(&mut cluster, &ctx).await?;

    // patch only when the pass changed something
    if base_status.as_ref() != cluster.status.as_ref() {
        let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": cluster.status });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("patched cluster status");
    }

    ctx.retries.success(&key);
    Ok(Action::requeue(STATUS_REFRESH))
}

/// Requeue with fast-then-slow pacing
pub fn error_policy(cluster: Arc<EtcdCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = reconcile_key(&cluster);
    let delay = ctx.retries.failure(&key);

    warn!(%key, %error, ?delay, "reconcile failed, requeuing");
    Action::requeue(delay)
}

fn reconcile_key(cluster: &EtcdCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

fn status_mut(cluster: &mut EtcdCluster) -> &mut EtcdClusterStatus {
    cluster.status.get_or_insert_with(Default::default)
}

/// Render and apply the cluster's child resources
pub async fn reconcile_resources(cluster: &mut EtcdCluster, ctx: &Context) -> Result<()> {
    if cluster.spec.pause {
        debug!("cluster is paused");
        return Ok(());
    }

    // bail if resources were already reconciled
    let generation = cluster.metadata.generation.unwrap_or_default();
    if status_mut(cluster).observed_generation == generation {
        return Ok(());
    }

    // resolve the restore source first, it decides whether the deployment is
    // rendered at all
    let (restore_key, defer_deployment) = resolve_restore(cluster, ctx).await?;

    let builder = render(cluster, &ctx.config, restore_key.as_deref(), defer_deployment)?;
    builder.apply(&ctx.client).await?;

    status_mut(cluster).observed_generation = generation;
    info!(generation, "applied cluster resources");

    Ok(())
}

/// Assemble the full child-resource set for a cluster.
///
/// Mutates only status conditions (backup availability); the caller applies
/// the returned builder.
pub fn render(
    cluster: &mut EtcdCluster,
    config: &super::OperatorConfig,
    restore_key: Option<&str>,
    defer_deployment: bool,
) -> Result<Builder> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_label = cluster_label_value(&name, &namespace);

    let mut b = Builder::new(&*cluster)
        .label("app.kubernetes.io/managed-by", "etcd-operator")
        .label(CLUSTER_LABEL, cluster_label.clone())
        .labels(&cluster.spec.common_labels)
        .annotations(&cluster.spec.common_annotations);

    // pki
    b.ca("peer-ca");
    b.ca("server-ca");

    let user_root = b
        .certificate("user-root")
        .issuer(b.child_name(&["server-ca"]))
        .usages(&[KeyUsage::ClientAuth]);
    b.add(user_root);

    let etcd_config = spec::etcd_config(cluster);
    let config_data = String::from_utf8(etcd_config.to_json()?).unwrap_or_default();
    b.add(b.config_map().data("etcd.json", config_data));

    let service_account = b.service_account();
    let service_account_name = service_account.name();
    b.add(service_account);
    b.add(
        b.role_binding()
            .service_account_subject(service_account_name)
            .cluster_role_ref("etcd-sidecar"),
    );

    b.add(
        b.pod_disruption_budget()
            .selector(CLUSTER_LABEL, cluster_label.clone())
            .max_unavailable(1),
    );

    // cluster service: learners never receive client traffic
    b.add(
        b.service()
            .selector(CLUSTER_LABEL, cluster_label.clone())
            .selector(crate::crd::LEARNER_LABEL, "false")
            .port("etcd-client-ssl", 2379, 2379)
            .port("etcd-server-ssl", 2380, 2380)
            .headless(),
    );

    // member deployment - bootstrap with a single replica
    if !defer_deployment {
        let replicas = match cluster.phase() {
            Some(ClusterPhase::Bootstrap) => 1,
            _ => cluster.spec.replicas,
        };

        let mut deployment = b
            .deployment()
            .replicas(replicas)
            .max_unavailable(0)
            .max_surge(1)
            .selector(CLUSTER_LABEL, cluster_label.clone())
            .pod_spec(spec::pod_spec(cluster, config, restore_key));
        if let Some(template) = &cluster.spec.pod_template {
            deployment = deployment
                .pod_labels(&template.labels)
                .pod_annotations(&template.annotations);
        }
        b.add(deployment);
    }

    // defrag cron job
    let defrag = cluster.spec.defrag.clone().unwrap_or_default();
    let mut defrag_job = b
        .cron_job("defrag")
        .schedule(defrag.schedule.as_deref().unwrap_or(spec::DEFRAG_SCHEDULE))
        .suspend(defrag.suspend)
        .forbid_concurrent()
        .ttl(spec::JOB_TTL)
        .active_deadline(spec::ACTIVE_DEADLINE)
        .pod_spec(spec::defrag_pod_spec(cluster, config));
    if let Some(template) = &cluster.spec.pod_template {
        defrag_job = defrag_job
            .pod_labels(&template.labels)
            .pod_annotations(&template.annotations);
    }
    b.add(defrag_job);

    // backup cron job, or its tombstone when backup is not configured
    if config.backup_configured() {
        b.add(b.secret("backup").string_data(&config.backup_env));

        let backup_spec = cluster.spec.backup.clone().unwrap_or_default();
        let mut backup_job = b
            .cron_job("backup")
            .schedule(
                backup_spec
                    .schedule
                    .as_deref()
                    .unwrap_or(spec::BACKUP_SCHEDULE),
            )
            .suspend(backup_spec.suspend)
            .forbid_concurrent()
            .ttl(spec::JOB_TTL)
            .active_deadline(spec::ACTIVE_DEADLINE)
            .pod_spec(spec::backup_pod_spec(cluster, config));
        if let Some(template) = &cluster.spec.pod_template {
            backup_job = backup_job
                .pod_labels(&template.labels)
                .pod_annotations(&template.annotations);
        }
        b.add(backup_job);
    } else {
        conditions::upsert(
            &mut status_mut(cluster).conditions,
            ClusterCondition::new(ClusterConditionType::Backup, ConditionStatus::False)
                .reason("BackupNotConfigured")
                .message("backup is not configured"),
        );

        b.delete(CronJob {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                namespace: Some(namespace.clone()),
                name: Some(format!("{name}-backup")),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    Ok(b)
}

/// Resolve the snapshot to restore from, when requested.
///
/// Returns the object key and whether deployment creation must wait for a
/// usable backup.
async fn resolve_restore(
    cluster: &mut EtcdCluster,
    ctx: &Context,
) -> Result<(Option<String>, bool)> {
    if cluster.phase() != Some(ClusterPhase::Bootstrap) {
        return Ok((None, false));
    }
    let Some(restore) = cluster.spec.restore.clone() else {
        return Ok((None, false));
    };

    if !ctx.config.backup_configured() {
        conditions::upsert(
            &mut status_mut(cluster).conditions,
            ClusterCondition::new(ClusterConditionType::Restore, ConditionStatus::False)
                .reason("BackupNotConfigured")
                .message("backup is not configured"),
        );
        return Ok((None, false));
    }

    if let Some(key) = restore.key {
        conditions::upsert(
            &mut status_mut(cluster).conditions,
            ClusterCondition::new(ClusterConditionType::Restore, ConditionStatus::True)
                .reason("BackupFound")
                .message(format!("using backup object {key:?}")),
        );
        return Ok((Some(key), false));
    }

    // restore requested without a key - pick the latest backup
    let prefix = restore.prefix.unwrap_or_else(|| {
        format!(
            "{}/{}",
            cluster.namespace().unwrap_or_default(),
            cluster.name_any()
        )
    });
    let bucket = ctx
        .config
        .backup_env
        .get("AWS_BUCKET_NAME")
        .cloned()
        .unwrap_or_default();

    let client = backup::new_client().await;
    match backup::latest_backup(&client, &bucket, &prefix).await? {
        Some(object) => {
            conditions::upsert(
                &mut status_mut(cluster).conditions,
                ClusterCondition::new(ClusterConditionType::Restore, ConditionStatus::True)
                    .reason("BackupFound")
                    .message(format!("using backup object {:?}", object.key)),
            );
            Ok((Some(object.key), false))
        }
        None => {
            conditions::upsert(
                &mut status_mut(cluster).conditions,
                ClusterCondition::new(ClusterConditionType::Restore, ConditionStatus::False)
                    .reason("BackupNotFound")
                    .message("latest backup object not found"),
            );
            Ok((None, true))
        }
    }
}

/// Observe the cluster and report status
pub async fn reconcile_status(cluster: &mut EtcdCluster, ctx: &Context) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    // updated replicas come from the deployment, everything else from pods
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let updated = deployments
        .get_opt(&name)
        .await?
        .and_then(|d| d.status)
        .and_then(|s| s.updated_replicas)
        .unwrap_or(0);
    status_mut(cluster).updated_replicas = updated;

    // mirror the backup cron job status
    let cron_jobs: Api<CronJob> = Api::namespaced(ctx.client.clone(), &namespace);
    status_mut(cluster).backup = cron_jobs
        .get_opt(&format!("{name}-backup"))
        .await?
        .map(|job| BackupStatus {
            enabled: !job
                .spec
                .as_ref()
                .and_then(|s| s.suspend)
                .unwrap_or_default(),
            last_schedule_time: job
                .status
                .as_ref()
                .and_then(|s| s.last_schedule_time.as_ref())
                .map(|t| t.0.to_rfc3339()),
            last_successful_time: job
                .status
                .as_ref()
                .and_then(|s| s.last_successful_time.as_ref())
                .map(|t| t.0.to_rfc3339()),
        });

    // pods are the scheduling unit, count them directly
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let selector = format!("{CLUSTER_LABEL}={}", cluster_label_value(&name, &namespace));
    let pod_list = pods.list(&ListParams::default().labels(&selector)).await?;

    let ready = pod_list.items.iter().filter(|pod| pod_ready(pod)).count() as i32;
    {
        let status = status_mut(cluster);
        status.replicas = pod_list.items.len() as i32;
        status.ready_replicas = ready;
    }

    match (cluster.phase(), ready) {
        // a running cluster with no replicas has crashed for good
        (Some(ClusterPhase::Running), 0) => {
            conditions::upsert(
                &mut status_mut(cluster).conditions,
                ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::False)
                    .reason("ClusterAvailable")
                    .message("cluster has no replicas running"),
            );
            transition(cluster, ctx, ClusterPhase::Failed).await;
            return Ok(());
        }
        // still waiting for the first member
        (_, 0) => return Ok(()),
        _ => {}
    }

    let secret_name = status_mut(cluster).secret_name.clone().unwrap_or_default();
    let endpoint = status_mut(cluster).endpoint.clone().unwrap_or_default();

    let tls = ctx.tls_cache.get(&(namespace.clone(), secret_name)).await?;

    let mut client = match etcd::connect(tls.clone(), &endpoint, MEMBER_LIST_TIMEOUT).await {
        Ok(client) => client,
        Err(err) => {
            no_connection(cluster, err);
            return Ok(());
        }
    };
    let members = match client.member_list().await {
        Ok(members) => members,
        Err(err) => {
            no_connection(cluster, crate::etcd::Error::from(err));
            return Ok(());
        }
    };

    // map the member list onto status, probing voting members in parallel
    let mut statuses = Vec::with_capacity(members.members().len());
    let mut probes = JoinSet::new();
    let mut learners = 0;

    for (i, member) in members.members().iter().enumerate() {
        let mut status = MemberStatus {
            id: crate::crd::format_member_id(member.id()),
            name: member.name().to_string(),
            ..Default::default()
        };

        if member.is_learner() {
            status.role = Some(MemberRole::Learner);
            learners += 1;
        } else if let Some(endpoint) = member.client_urls().first() {
            status.endpoint = endpoint.clone();

            let endpoint = endpoint.clone();
            let tls = tls.clone();
            probes.spawn(async move {
                let mut client = etcd::connect(tls, &endpoint, MEMBER_STATUS_TIMEOUT).await.ok()?;
                let resp = client.status().await.ok()?;

                let member_id = resp.header().map(|h| h.member_id()).unwrap_or_default();
                let role = if resp.leader() == member_id {
                    MemberRole::Leader
                } else {
                    MemberRole::Member
                };

                Some((
                    i,
                    role,
                    resp.version().to_string(),
                    resp.db_size(),
                    resp.errors().to_vec(),
                ))
            });
        }

        statuses.push(status);
    }

    while let Some(probe) = probes.join_next().await {
        let Ok(Some((i, role, version, db_size, errors))) = probe else {
            continue;
        };

        let status = &mut statuses[i];
        status.role = Some(role);
        status.version = Some(version);
        status.size = Some(db_size);
        status.available = errors.is_empty();
        status.errors = errors;
    }

    let available = statuses.iter().filter(|m| m.available).count() as i32;
    let leader_version = statuses
        .iter()
        .find(|m| m.role() == MemberRole::Leader)
        .and_then(|m| m.version.clone());

    // sort members by role and name
    statuses.sort_by(|l, r| {
        l.role()
            .order()
            .cmp(&r.role().order())
            .then_with(|| l.name.cmp(&r.name))
    });

    {
        let status = status_mut(cluster);
        status.members = statuses;
        status.learner_replicas = learners;
        status.available_replicas = available;
        if leader_version.is_some() {
            status.version = leader_version;
        }
    }

    // bootstrap completed - rerun resource rendering at full replica count
    if cluster.phase() == Some(ClusterPhase::Bootstrap) && available >= 1 {
        status_mut(cluster).observed_generation = 0;
        transition(cluster, ctx, ClusterPhase::Running).await;
        return Ok(());
    }

    let quorum = cluster.spec.replicas / 2 + 1;
    let condition = if available < quorum {
        ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::False)
            .reason("NoQuorum")
            .message(format!(
                "{available} replicas are less than required quorum {quorum}"
            ))
    } else if available < cluster.spec.replicas {
        ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::True)
            .reason("Degraded")
            .message(format!(
                "{available} out of {} replicas are available",
                cluster.spec.replicas
            ))
    } else {
        ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::True)
            .reason("ClusterAvailable")
    };
    conditions::upsert(&mut status_mut(cluster).conditions, condition);

    Ok(())
}

fn no_connection(cluster: &mut EtcdCluster, err: crate::etcd::Error) {
    conditions::upsert(
        &mut status_mut(cluster).conditions,
        ClusterCondition::new(ClusterConditionType::Available, ConditionStatus::False)
            .reason("NoConnection")
            .message(err.to_string()),
    );
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

async fn transition(cluster: &mut EtcdCluster, ctx: &Context, phase: ClusterPhase) {
    let from = cluster
        .phase()
        .map(|p| p.to_string())
        .unwrap_or_default();

    info!(%from, to = %phase, "phase transition");
    ctx.publish_transition(cluster, &from, &phase.to_string()).await;

    status_mut(cluster).phase = Some(phase);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_ready(status: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "main-abc" },
            "status": {
                "conditions": [
                    { "type": "Ready", "status": status },
                    { "type": "PodScheduled", "status": "True" }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn pod_ready_checks_ready_condition() {
        assert!(pod_ready(&pod_with_ready("True")));
        assert!(!pod_ready(&pod_with_ready("False")));
        assert!(!pod_ready(&Pod::default()));
    }

    #[test]
    fn quorum_boundaries() {
        // mirrors the condition selection in reconcile_status
        let quorum = |replicas: i32| replicas / 2 + 1;
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(5), 3);
    }
}
