//! RBAC child resources.

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};

use super::builder::{Builder, Child};

impl Builder {
    pub fn role_binding(&self) -> RoleBindingBuilder {
        RoleBindingBuilder {
            namespace: self.namespace().unwrap_or_default().to_string(),
            role_binding: RoleBinding {
                metadata: self.object_meta(&[]),
                ..Default::default()
            },
        }
    }
}

pub struct RoleBindingBuilder {
    namespace: String,
    role_binding: RoleBinding,
}

impl RoleBindingBuilder {
    pub fn service_account_subject(mut self, name: impl Into<String>) -> Self {
        self.role_binding
            .subjects
            .get_or_insert_with(Vec::new)
            .push(Subject {
                kind: "ServiceAccount".to_string(),
                name: name.into(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            });
        self
    }

    pub fn cluster_role_ref(mut self, name: impl Into<String>) -> Self {
        self.role_binding.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: name.into(),
        };
        self
    }
}

impl From<RoleBindingBuilder> for Child {
    fn from(builder: RoleBindingBuilder) -> Child {
        Child::RoleBinding(builder.role_binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    #[test]
    fn binds_service_account_to_cluster_role() {
        let mut cluster =
            EtcdCluster::new("main", serde_json::from_str::<EtcdClusterSpec>("{}").unwrap());
        cluster.metadata.namespace = Some("etcd-system".to_string());

        let child: Child = Builder::new(&cluster)
            .role_binding()
            .service_account_subject("main")
            .cluster_role_ref("etcd-sidecar")
            .into();

        let Child::RoleBinding(role_binding) = child else {
            panic!("expected role binding");
        };
        assert_eq!(role_binding.role_ref.kind, "ClusterRole");
        assert_eq!(role_binding.role_ref.name, "etcd-sidecar");

        let subjects = role_binding.subjects.unwrap();
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].namespace.as_deref(), Some("etcd-system"));
    }
}
