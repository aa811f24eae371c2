//! One-shot member configuration on startup.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::Api;
use tracing::info;

use crate::crd::{format_member_id, LEARNER_LABEL, MEMBER_ID_LABEL};
use crate::etcd::{self, errors, InitialState};

use super::pki::CredentialGenerator;
use super::{Config, Error, Result, State};

/// Render the member configuration: load the base config, issue credentials,
/// join the cluster when needed and write the final config file.
///
/// The pod label update lands before the config file write; a crash between
/// the two re-runs from the base config and re-admission is idempotent on the
/// member name.
pub async fn configure(
    client: &kube::Client,
    config: &Config,
    state: &State,
    generator: &CredentialGenerator,
) -> Result<()> {
    // a prior incarnation may have left a rendered config behind
    let loaded = match etcd::Config::load(&config.config_file) {
        Ok(loaded) => loaded,
        Err(etcd::Error::ReadConfig(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            etcd::Config::load(&config.base_config_file)?
        }
        Err(err) => return Err(err.into()),
    };
    *state.etcd_config.write().await = loaded;

    generator.generate().await?;

    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.namespace);
    let pod = pods.get(&config.name).await?;
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or(Error::MissingPodIp)?;

    let initial_state = {
        let mut etcd_config = state.etcd_config.write().await;
        etcd_config.name = config.name.clone();
        etcd_config.advertise_client_urls = format!("https://{pod_ip}:2379");
        etcd_config.initial_advertise_peer_urls = format!("https://{pod_ip}:2380");
        etcd_config.initial_cluster_state
    };

    let mut labels = pod.metadata.labels.clone().unwrap_or_default();
    match initial_state {
        // bootstrap - we are the whole cluster
        Some(InitialState::New) => {
            state.etcd_config.write().await.initial_cluster =
                format!("{}=https://{pod_ip}:2380", config.name);
            labels.insert(LEARNER_LABEL.to_string(), "false".to_string());
        }
        // join an existing cluster as learner
        Some(InitialState::Existing) => {
            let admitted = add_learner(config, state).await?;
            state.etcd_config.write().await.initial_cluster = admitted.initial_cluster;
            labels.insert(LEARNER_LABEL.to_string(), admitted.is_learner.to_string());
            labels.insert(MEMBER_ID_LABEL.to_string(), format_member_id(admitted.id));
        }
        None => return Err(Error::InvalidClusterState),
    }

    // label update first, then the config file
    if Some(&labels) != pod.metadata.labels.as_ref() {
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        pods.patch(
            &config.name,
            &PatchParams::default(),
            &Patch::Strategic(&patch),
        )
        .await?;
    }

    state.etcd_config.read().await.save(&config.config_file)?;
    info!(path = %config.config_file.display(), "config written");

    Ok(())
}

pub(crate) struct AdmittedMember {
    pub id: u64,
    pub is_learner: bool,
    pub initial_cluster: String,
}

/// Admit this member into the cluster as a learner.
///
/// Recovery is idempotent: a member carrying our pod name already joined in a
/// previous incarnation and is returned as-is. Otherwise admission retries
/// through cluster-health and learner-count preconditions until cancelled.
pub(crate) async fn add_learner(config: &Config, state: &State) -> Result<AdmittedMember> {
    let tls = state
        .tls
        .read()
        .await
        .clone()
        .ok_or(Error::NotConfigured)?;
    let mut etcd = etcd::connect(tls, &config.endpoint, config.timeout).await?;

    let peer_url = state
        .etcd_config
        .read()
        .await
        .initial_advertise_peer_urls
        .clone();

    // check if the member already exists
    let members = etcd.member_list().await?;
    if let Some(member) = members
        .members()
        .iter()
        .find(|member| member.name() == config.name)
    {
        return Ok(AdmittedMember {
            id: member.id(),
            is_learner: member.is_learner(),
            initial_cluster: initial_cluster(&config.name, &peer_url, members.members()),
        });
    }

    // retry loop until the learner is admitted
    loop {
        let options = etcd_client::MemberAddOptions::new().with_learner();
        match etcd.member_add([peer_url.clone()], Some(options)).await {
            Ok(resp) => {
                let Some(member) = resp.member() else {
                    // no member in the response, treat as a failed attempt
                    tokio::time::sleep(config.interval).await;
                    continue;
                };

                let id = member.id();
                info!(id = %format_member_id(id), "added learner");

                return Ok(AdmittedMember {
                    id,
                    is_learner: member.is_learner(),
                    initial_cluster: initial_cluster(&config.name, &peer_url, resp.members()),
                });
            }
            Err(err) if errors::is_deadline_exceeded(&err) => {
                info!("add learner: timeout");
            }
            Err(err) if errors::is_unhealthy(&err) => {
                info!("add learner: waiting for cluster to be healthy");
            }
            Err(err) if errors::is_too_many_learners(&err) => {
                info!("add learner: waiting for cluster to allow learner to join");
            }
            Err(err) => return Err(err.into()),
        }

        tokio::time::sleep(config.interval).await;
    }
}

/// Assemble the initial-cluster list: ourselves plus every started member
fn initial_cluster(name: &str, peer_url: &str, members: &[etcd_client::Member]) -> String {
    let mut endpoints = vec![format!("{name}={peer_url}")];
    for member in members {
        if member.name().is_empty() || member.name() == name {
            continue;
        }
        if let Some(url) = member.peer_urls().first() {
            endpoints.push(format!("{}={}", member.name(), url));
        }
    }

    endpoints.join(",")
}
