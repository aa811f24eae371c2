//! Member credential issuance and rotation.

use std::sync::Arc;
use std::time::SystemTime;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::Api;
use tracing::{error, info};

use crate::crd::{
    format_renew_at, parse_cluster, parse_renew_at, CLUSTER_LABEL, RENEW_AT_ANNOTATION,
};
use crate::pki::{generate_credentials, DEFAULT_DURATION};
use crate::resources::{Builder, KeyUsage};

use super::{Config, Error, Result, State};

pub struct CredentialGenerator {
    client: kube::Client,
    config: Arc<Config>,
    state: Arc<State>,
}

impl CredentialGenerator {
    pub fn new(client: kube::Client, config: Arc<Config>, state: Arc<State>) -> Self {
        Self {
            client,
            config,
            state,
        }
    }

    /// Issue peer and server credentials when the current ones are close to
    /// expiry, write them out and refresh the renew-at annotation.
    ///
    /// etcd does not reload trust anchors at runtime; when a CA file changes
    /// on disk the whole pod is restarted through pid 1.
    pub async fn generate(&self) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let pod = pods.get(&self.config.name).await?;

        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let (cluster_name, _) = parse_cluster(&labels).ok_or(Error::MissingClusterLabel)?;

        let start = Utc::now();
        let start_mtime = SystemTime::now();
        let annotations = pod.metadata.annotations.clone().unwrap_or_default();
        match parse_renew_at(&annotations) {
            Some(renew_at) if renew_at > start => return Ok(()),
            Some(renew_at) => info!(%renew_at, "credentials expired"),
            None => {}
        }

        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or(Error::MissingPodIp)?;
        let pod_name = self.config.name.clone();
        let namespace = self.config.namespace.clone();

        // certificate prototypes, owned by the pod so requests are garbage
        // collected with it
        let builder = Builder::new(&pod).label(
            CLUSTER_LABEL,
            labels.get(CLUSTER_LABEL).cloned().unwrap_or_default(),
        );
        let owner_ref = builder.owner_ref();

        let mut peer = builder
            .certificate("peer")
            .duration(DEFAULT_DURATION)
            .issuer(format!("{cluster_name}-peer-ca"))
            .usages(&[KeyUsage::ServerAuth, KeyUsage::ClientAuth])
            .ip(pod_ip.clone())
            .build();
        peer.metadata.owner_references = Some(vec![owner_ref.clone()]);

        let mut server = builder
            .certificate("server")
            .duration(DEFAULT_DURATION)
            .issuer(format!("{cluster_name}-server-ca"))
            .usages(&[KeyUsage::ServerAuth, KeyUsage::ClientAuth])
            .ip(pod_ip)
            .ip("127.0.0.1")
            .dns(&[&pod_name, &cluster_name, &namespace, "svc.cluster.local"])
            .dns(&[&cluster_name, &namespace, "svc.cluster.local"])
            .dns(&["localhost"])
            .dns(&[&pod_name])
            .build();
        server.metadata.owner_references = Some(vec![owner_ref]);

        let (peer_transport, server_transport) = {
            let etcd_config = self.state.etcd_config.read().await;
            (
                etcd_config.peer_transport_security.clone(),
                etcd_config.client_transport_security.clone(),
            )
        };

        let (peer_creds, server_creds) = tokio::try_join!(
            generate_credentials(&self.client, &peer, self.config.interval),
            generate_credentials(&self.client, &server, self.config.interval),
        )?;

        if let Some(transport) = &peer_transport {
            peer_creds.write_transport_security(transport)?;
            info!(cert = %transport.cert_file, "generated peer credentials");
        }

        let mut renew_at = None;
        if let Some(transport) = &server_transport {
            server_creds.write_transport_security(transport)?;
            renew_at = server_creds.renew_at;
            info!(cert = %transport.cert_file, ?renew_at, "generated server credentials");
        }

        *self.state.tls.write().await = Some(server_creds.tls_options()?);

        // persist when the next rotation is due
        if let Some(renew_at) = renew_at {
            let patch = serde_json::json!({
                "metadata": {
                    "annotations": { RENEW_AT_ANNOTATION: format_renew_at(renew_at) }
                }
            });
            pods.patch(
                &self.config.name,
                &PatchParams::default(),
                &Patch::Strategic(&patch),
            )
            .await?;
        }

        // a CA that moved underneath us requires an etcd restart
        let ca_files = [
            server_transport.as_ref().map(|t| t.trusted_ca_file.clone()),
            peer_transport.as_ref().map(|t| t.trusted_ca_file.clone()),
        ];
        let mut reload = false;
        for ca_file in ca_files.into_iter().flatten() {
            let modified = std::fs::metadata(&ca_file)?.modified()?;
            if modified > start_mtime {
                reload = true;
                break;
            }
        }
        if reload {
            info!("trust anchors changed, restarting pod");
            let rc = unsafe { libc::kill(1, libc::SIGKILL) };
            if rc != 0 {
                error!("restart etcd container");
            }
        }

        Ok(())
    }
}
