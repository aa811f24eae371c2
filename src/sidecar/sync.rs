//! Cluster membership maintenance, one pass per interval.
//!
//! Every sidecar refreshes its own pod labels from the local member status;
//! only the leader prunes orphaned members and promotes caught-up learners,
//! at most one of each per pass.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams};
use kube::Api;
use tracing::{info, warn};

use crate::crd::{
    format_member_id, parse_member_id, CLUSTER_LABEL, LEARNER_LABEL, MEMBER_ID_LABEL,
};
use crate::etcd::{self, errors};

use super::{Config, Error, Result, State};

const LOCAL_ENDPOINT: &str = "https://127.0.0.1:2379";

/// Run the membership maintenance loop until cancelled
pub async fn watch_cluster(
    client: kube::Client,
    config: Arc<Config>,
    state: Arc<State>,
) -> Result<()> {
    let tls = state
        .tls
        .read()
        .await
        .clone()
        .ok_or(Error::NotConfigured)?;

    let mut cluster = etcd::connect(tls.clone(), &config.endpoint, config.timeout).await?;
    let mut local = etcd::connect(tls, LOCAL_ENDPOINT, config.timeout).await?;

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let pass = sync(&client, &config, &mut cluster, &mut local);
        match tokio::time::timeout(config.timeout, pass).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "sync"),
            Err(_) => warn!("sync timed out"),
        }
    }
}

async fn sync(
    client: &kube::Client,
    config: &Config,
    cluster: &mut etcd_client::Client,
    local: &mut etcd_client::Client,
) -> Result<()> {
    let status = local.status().await?;
    let member_id = status.header().map(|h| h.member_id()).unwrap_or_default();

    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let pod = pods.get(&config.name).await?;

    // refresh our own labels
    let mut labels = pod.metadata.labels.clone().unwrap_or_default();
    labels.insert(LEARNER_LABEL.to_string(), status.is_learner().to_string());
    labels.insert(MEMBER_ID_LABEL.to_string(), format_member_id(member_id));

    if Some(&labels) != pod.metadata.labels.as_ref() {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        pods.patch(
            &config.name,
            &PatchParams::default(),
            &Patch::Strategic(&patch),
        )
        .await?;
    }

    // membership maintenance is the leader's job
    if status.leader() != member_id {
        return Ok(());
    }

    let resp = cluster.member_list().await?;
    let members: Vec<MemberView> = resp
        .members()
        .iter()
        .map(|member| MemberView {
            id: member.id(),
            name: member.name().to_string(),
            is_learner: member.is_learner(),
        })
        .collect();

    if config.prune {
        prune(client, config, &pod, cluster, &members).await?;
    }
    promote(cluster, &members).await?;

    Ok(())
}

/// Remove at most one member which has no backing pod.
///
/// A pod backs a member when its name matches the member name or its
/// member-id label matches the member id; unstarted members (empty name) are
/// never pruned.
async fn prune(
    client: &kube::Client,
    config: &Config,
    pod: &Pod,
    cluster: &mut etcd_client::Client,
    members: &[MemberView],
) -> Result<()> {
    let cluster_label = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CLUSTER_LABEL))
        .cloned()
        .unwrap_or_default();

    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let selector = format!("{CLUSTER_LABEL}={cluster_label}");
    let pod_list = match pods.list(&ListParams::default().labels(&selector)).await {
        Ok(list) => list,
        Err(kube::Error::Api(response)) if response.code == 429 => {
            info!("prune: too many requests");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let pod_ids: Vec<(String, Option<u64>)> = pod_list
        .items
        .iter()
        .map(|pod| {
            let name = pod.metadata.name.clone().unwrap_or_default();
            let id = parse_member_id(&pod.metadata.labels.clone().unwrap_or_default());
            (name, id)
        })
        .collect();

    let Some(orphan) = prune_target(members, &pod_ids) else {
        return Ok(());
    };

    match cluster.member_remove(orphan).await {
        Ok(_) => {
            info!(id = %format_member_id(orphan), "removed member");
            Ok(())
        }
        Err(err) if errors::is_member_not_found(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Promote at most one started learner; a learner still catching up is left
/// for the next pass.
async fn promote(cluster: &mut etcd_client::Client, members: &[MemberView]) -> Result<()> {
    let Some(learner) = promote_target(members) else {
        return Ok(());
    };

    match cluster.member_promote(learner).await {
        Ok(_) => {
            info!(id = %format_member_id(learner), "promoted learner");
            Ok(())
        }
        Err(err) if errors::is_learner_not_ready(&err) => {
            info!(id = %format_member_id(learner), "waiting for learner to catch up");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Membership view used to pick prune and promote targets; factored out of
/// the etcd types for testability.
#[derive(Clone, Debug, PartialEq)]
pub struct MemberView {
    pub id: u64,
    pub name: String,
    pub is_learner: bool,
}

/// Prune target: first started member with no backing pod
pub fn prune_target(members: &[MemberView], pods: &[(String, Option<u64>)]) -> Option<u64> {
    members
        .iter()
        .find(|member| {
            !member.name.is_empty()
                && !pods
                    .iter()
                    .any(|(name, id)| *name == member.name || *id == Some(member.id))
        })
        .map(|member| member.id)
}

/// Promote target: first started learner
pub fn promote_target(members: &[MemberView]) -> Option<u64> {
    members
        .iter()
        .find(|member| member.is_learner && !member.name.is_empty())
        .map(|member| member.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str, is_learner: bool) -> MemberView {
        MemberView {
            id,
            name: name.to_string(),
            is_learner,
        }
    }

    #[test]
    fn prune_skips_members_with_pods() {
        let members = vec![member(1, "main-a", false), member(2, "main-b", false)];
        let pods = vec![
            ("main-a".to_string(), Some(1)),
            ("main-b".to_string(), None),
        ];

        assert_eq!(prune_target(&members, &pods), None);
    }

    #[test]
    fn prune_matches_by_member_id_label() {
        // pod was renamed but still carries the member id
        let members = vec![member(7, "old-name", false)];
        let pods = vec![("new-name".to_string(), Some(7))];

        assert_eq!(prune_target(&members, &pods), None);
    }

    #[test]
    fn prune_targets_orphan() {
        let members = vec![member(1, "main-a", false), member(2, "gone", false)];
        let pods = vec![("main-a".to_string(), Some(1))];

        assert_eq!(prune_target(&members, &pods), Some(2));
    }

    #[test]
    fn prune_never_targets_unstarted_members() {
        let members = vec![member(3, "", true)];
        let pods = vec![];

        assert_eq!(prune_target(&members, &pods), None);
    }

    #[test]
    fn promote_considers_started_learners_only() {
        let members = vec![
            member(1, "main-a", false),
            member(2, "", true),
            member(3, "main-c", true),
        ];

        assert_eq!(promote_target(&members), Some(3));
    }

    #[test]
    fn promote_none_without_learners() {
        let members = vec![member(1, "main-a", false)];
        assert_eq!(promote_target(&members), None);
    }
}
