//! Declarative composition of child resources owned by a cluster.
//!
//! Children are collected first, then applied in one pass with server-side
//! apply under a stable field owner; tombstones are deleted last. Re-applying
//! an unchanged set produces no writes.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use super::cert_manager::{Certificate, Issuer};

pub const FIELD_MANAGER: &str = "etcd-operator";

#[derive(Error, Debug)]
pub enum Error {
    #[error("encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("apply {kind} {name}: {source}")]
    Apply {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("delete {kind} {name}: {source}")]
    Delete {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Controller owner identity stamped onto every namespaced child
#[derive(Clone, Debug)]
pub struct Owner {
    api_version: String,
    kind: String,
    name: String,
    uid: String,
}

impl Owner {
    pub fn from_resource<K>(owner: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            name: owner.meta().name.clone().unwrap_or_default(),
            uid: owner.meta().uid.clone().unwrap_or_default(),
        }
    }

    fn reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Child resource kinds the builder knows how to apply
#[derive(Clone, Debug)]
pub enum Child {
    Deployment(Deployment),
    ServiceAccount(ServiceAccount),
    Service(Service),
    ConfigMap(ConfigMap),
    Secret(Secret),
    RoleBinding(RoleBinding),
    PodDisruptionBudget(PodDisruptionBudget),
    CronJob(CronJob),
    Issuer(Issuer),
    Certificate(Certificate),
}

macro_rules! child_dispatch {
    ($self:expr, $obj:pat => $body:expr) => {
        match $self {
            Child::Deployment($obj) => $body,
            Child::ServiceAccount($obj) => $body,
            Child::Service($obj) => $body,
            Child::ConfigMap($obj) => $body,
            Child::Secret($obj) => $body,
            Child::RoleBinding($obj) => $body,
            Child::PodDisruptionBudget($obj) => $body,
            Child::CronJob($obj) => $body,
            Child::Issuer($obj) => $body,
            Child::Certificate($obj) => $body,
        }
    };
}

impl Child {
    pub fn kind(&self) -> &'static str {
        match self {
            Child::Deployment(_) => "Deployment",
            Child::ServiceAccount(_) => "ServiceAccount",
            Child::Service(_) => "Service",
            Child::ConfigMap(_) => "ConfigMap",
            Child::Secret(_) => "Secret",
            Child::RoleBinding(_) => "RoleBinding",
            Child::PodDisruptionBudget(_) => "PodDisruptionBudget",
            Child::CronJob(_) => "CronJob",
            Child::Issuer(_) => "Issuer",
            Child::Certificate(_) => "Certificate",
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        child_dispatch!(self, obj => obj.meta())
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        child_dispatch!(self, obj => obj.meta_mut())
    }

    async fn apply(&self, client: &kube::Client, params: &PatchParams) -> Result<()> {
        child_dispatch!(self, obj => apply_object(client, self.kind(), obj, params).await)
    }

    async fn delete(&self, client: &kube::Client) -> Result<()> {
        child_dispatch!(self, obj => delete_object(client, self.kind(), obj).await)
    }
}

macro_rules! child_from {
    ($type:ty, $variant:ident) => {
        impl From<$type> for Child {
            fn from(obj: $type) -> Child {
                Child::$variant(obj)
            }
        }
    };
}

child_from!(Deployment, Deployment);
child_from!(ServiceAccount, ServiceAccount);
child_from!(Service, Service);
child_from!(ConfigMap, ConfigMap);
child_from!(Secret, Secret);
child_from!(RoleBinding, RoleBinding);
child_from!(PodDisruptionBudget, PodDisruptionBudget);
child_from!(CronJob, CronJob);
child_from!(Issuer, Issuer);
child_from!(Certificate, Certificate);

/// Server-side apply with the object's type meta filled in, since typed
/// structs do not carry apiVersion/kind on the wire.
async fn apply_object<K>(
    client: &kube::Client,
    kind: &'static str,
    obj: &K,
    params: &PatchParams,
) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
{
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let name = obj.meta().name.clone().unwrap_or_default();

    let mut value = serde_json::to_value(obj).map_err(|source| Error::Encode { kind, source })?;
    value["apiVersion"] = K::api_version(&()).as_ref().into();
    value["kind"] = K::kind(&()).as_ref().into();

    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    api.patch(&name, params, &Patch::Apply(&value))
        .await
        .map_err(|source| Error::Apply { kind, name, source })?;

    Ok(())
}

async fn delete_object<K>(client: &kube::Client, kind: &'static str, obj: &K) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
{
    let namespace = obj.meta().namespace.clone().unwrap_or_default();
    let name = obj.meta().name.clone().unwrap_or_default();

    let api: Api<K> = Api::namespaced(client.clone(), &namespace);
    match api.delete(&name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(source) => Err(Error::Delete { kind, name, source }),
    }
}

pub struct Builder {
    owner: Owner,
    namespace: Option<String>,
    prefix: String,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    children: Vec<Child>,
    tombstones: Vec<Child>,
}

impl Builder {
    pub fn new<K>(owner: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            owner: Owner::from_resource(owner),
            namespace: owner.meta().namespace.clone(),
            prefix: owner.meta().name.clone().unwrap_or_default(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            children: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels.extend(labels.clone());
        self
    }

    pub fn annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        self.annotations.extend(annotations.clone());
        self
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Controller owner reference for children managed outside the builder
    pub fn owner_ref(&self) -> OwnerReference {
        self.owner.reference()
    }

    /// Child names are `<owner>-<suffix...>`; no suffix yields the owner name
    pub fn child_name(&self, parts: &[&str]) -> String {
        let mut name = vec![self.prefix.as_str()];
        name.extend_from_slice(parts);
        name.join("-")
    }

    pub(super) fn object_meta(&self, parts: &[&str]) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.child_name(parts)),
            namespace: self.namespace.clone(),
            ..Default::default()
        }
    }

    /// Record a child, decorating it with the builder's labels and
    /// annotations; the child wins on conflicting keys.
    pub fn add(&mut self, child: impl Into<Child>) {
        let mut child = child.into();

        let meta = child.meta_mut();
        let mut labels = self.labels.clone();
        labels.extend(meta.labels.take().unwrap_or_default());
        if !labels.is_empty() {
            meta.labels = Some(labels);
        }

        let mut annotations = self.annotations.clone();
        annotations.extend(meta.annotations.take().unwrap_or_default());
        if !annotations.is_empty() {
            meta.annotations = Some(annotations);
        }

        self.children.push(child);
    }

    /// Record a tombstone for a previously rendered child
    pub fn delete(&mut self, child: impl Into<Child>) {
        self.tombstones.push(child.into());
    }

    pub fn children(&self) -> &[Child] {
        &self.children
    }

    pub fn tombstones(&self) -> &[Child] {
        &self.tombstones
    }

    /// Stamp the controller owner reference onto every namespaced child
    pub fn build(&mut self) {
        let reference = self.owner.reference();
        for child in &mut self.children {
            let meta = child.meta_mut();
            if meta.namespace.is_some() {
                meta.owner_references = Some(vec![reference.clone()]);
            }
        }
    }

    /// Apply all children and delete all tombstones.
    ///
    /// Fails on the first error; partial progress stands, the next reconcile
    /// retries.
    pub async fn apply(mut self, client: &kube::Client) -> Result<()> {
        self.build();

        let params = PatchParams::apply(FIELD_MANAGER).force();
        for child in &self.children {
            child.apply(client, &params).await?;
        }

        for tombstone in &self.tombstones {
            tombstone.delete(client).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    fn test_cluster() -> EtcdCluster {
        let mut cluster = EtcdCluster::new(
            "main",
            EtcdClusterSpec {
                replicas: 3,
                ..serde_json::from_str("{}").unwrap()
            },
        );
        cluster.metadata.namespace = Some("etcd-system".to_string());
        cluster.metadata.uid = Some("uid-1234".to_string());
        cluster
    }

    #[test]
    fn child_names_join_prefix() {
        let cluster = test_cluster();
        let builder = Builder::new(&cluster);

        assert_eq!(builder.child_name(&[]), "main");
        assert_eq!(builder.child_name(&["backup"]), "main-backup");
        assert_eq!(builder.child_name(&["server", "ca"]), "main-server-ca");
    }

    #[test]
    fn add_merges_labels_child_wins() {
        let cluster = test_cluster();
        let mut builder = Builder::new(&cluster)
            .label("app.kubernetes.io/managed-by", "etcd-operator")
            .label("shared", "builder");

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some("etcd-system".to_string()),
                labels: Some(BTreeMap::from([(
                    "shared".to_string(),
                    "child".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        builder.add(config_map);

        let labels = builder.children()[0].meta().labels.as_ref().unwrap();
        assert_eq!(labels.get("shared").unwrap(), "child");
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by").unwrap(),
            "etcd-operator"
        );
    }

    #[test]
    fn build_sets_controller_owner() {
        let cluster = test_cluster();
        let mut builder = Builder::new(&cluster);
        builder.add(ConfigMap {
            metadata: builder.object_meta(&[]),
            ..Default::default()
        });

        builder.build();

        let refs = builder.children()[0].meta().owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "EtcdCluster");
        assert_eq!(refs[0].name, "main");
        assert_eq!(refs[0].uid, "uid-1234");
        assert_eq!(refs[0].controller, Some(true));
    }
}
