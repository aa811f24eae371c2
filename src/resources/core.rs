//! Core v1 child resources: Service, ConfigMap, Secret, ServiceAccount.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::builder::{Builder, Child};

impl Builder {
    pub fn service(&self) -> ServiceBuilder {
        ServiceBuilder {
            service: Service {
                metadata: self.object_meta(&[]),
                spec: Some(ServiceSpec::default()),
                ..Default::default()
            },
        }
    }

    pub fn config_map(&self) -> ConfigMapBuilder {
        ConfigMapBuilder {
            config_map: ConfigMap {
                metadata: self.object_meta(&[]),
                ..Default::default()
            },
        }
    }

    pub fn secret(&self, name: &str) -> SecretBuilder {
        SecretBuilder {
            secret: Secret {
                metadata: self.object_meta(&[name]),
                ..Default::default()
            },
        }
    }

    pub fn service_account(&self) -> ServiceAccountBuilder {
        ServiceAccountBuilder {
            service_account: ServiceAccount {
                metadata: self.object_meta(&[]),
                ..Default::default()
            },
        }
    }
}

pub struct ServiceBuilder {
    service: Service,
}

impl ServiceBuilder {
    pub fn selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let spec = self.service.spec.get_or_insert_with(Default::default);
        spec.selector
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, name: &str, port: i32, target: i32) -> Self {
        let spec = self.service.spec.get_or_insert_with(Default::default);
        spec.ports.get_or_insert_with(Vec::new).push(ServicePort {
            name: Some(name.to_string()),
            port,
            target_port: Some(IntOrString::Int(target)),
            ..Default::default()
        });
        self
    }

    pub fn headless(mut self) -> Self {
        let spec = self.service.spec.get_or_insert_with(Default::default);
        spec.cluster_ip = Some("None".to_string());
        self
    }
}

impl From<ServiceBuilder> for Child {
    fn from(builder: ServiceBuilder) -> Child {
        Child::Service(builder.service)
    }
}

pub struct ConfigMapBuilder {
    config_map: ConfigMap,
}

impl ConfigMapBuilder {
    pub fn data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config_map
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }
}

impl From<ConfigMapBuilder> for Child {
    fn from(builder: ConfigMapBuilder) -> Child {
        Child::ConfigMap(builder.config_map)
    }
}

pub struct SecretBuilder {
    secret: Secret,
}

impl SecretBuilder {
    pub fn string_data(mut self, data: &BTreeMap<String, String>) -> Self {
        self.secret
            .string_data
            .get_or_insert_with(BTreeMap::new)
            .extend(data.clone());
        self
    }
}

impl From<SecretBuilder> for Child {
    fn from(builder: SecretBuilder) -> Child {
        Child::Secret(builder.secret)
    }
}

pub struct ServiceAccountBuilder {
    service_account: ServiceAccount,
}

impl ServiceAccountBuilder {
    pub fn name(&self) -> String {
        self.service_account.metadata.name.clone().unwrap_or_default()
    }
}

impl From<ServiceAccountBuilder> for Child {
    fn from(builder: ServiceAccountBuilder) -> Child {
        Child::ServiceAccount(builder.service_account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    fn builder() -> Builder {
        let mut cluster =
            EtcdCluster::new("main", serde_json::from_str::<EtcdClusterSpec>("{}").unwrap());
        cluster.metadata.namespace = Some("etcd-system".to_string());
        Builder::new(&cluster)
    }

    #[test]
    fn headless_service_with_ports() {
        let child: Child = builder()
            .service()
            .selector("cluster", "main.etcd-system")
            .port("etcd-client-ssl", 2379, 2379)
            .port("etcd-server-ssl", 2380, 2380)
            .headless()
            .into();

        let Child::Service(service) = child else {
            panic!("expected service");
        };
        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.ports.as_ref().unwrap().len(), 2);
        assert_eq!(
            spec.selector.unwrap().get("cluster").unwrap(),
            "main.etcd-system"
        );
    }

    #[test]
    fn secret_name_is_prefixed() {
        let child: Child = builder()
            .secret("backup")
            .string_data(&BTreeMap::from([(
                "AWS_BUCKET_NAME".to_string(),
                "backups".to_string(),
            )]))
            .into();

        assert_eq!(child.meta().name.as_deref(), Some("main-backup"));
    }
}
