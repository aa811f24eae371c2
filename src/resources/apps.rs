//! Member Deployment construction.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::builder::{Builder, Child};

impl Builder {
    pub fn deployment(&self) -> DeploymentBuilder {
        DeploymentBuilder {
            deployment: Deployment {
                metadata: self.object_meta(&[]),
                spec: Some(DeploymentSpec::default()),
                ..Default::default()
            },
        }
    }
}

pub struct DeploymentBuilder {
    deployment: Deployment,
}

impl DeploymentBuilder {
    pub fn replicas(mut self, replicas: i32) -> Self {
        self.spec().replicas = Some(replicas);
        self
    }

    pub fn max_unavailable(mut self, value: i32) -> Self {
        self.rolling_update().max_unavailable = Some(IntOrString::Int(value));
        self
    }

    pub fn max_surge(mut self, value: i32) -> Self {
        self.rolling_update().max_surge = Some(IntOrString::Int(value));
        self
    }

    /// Adds to the selector and the pod template labels so rendered pods
    /// match the Deployment they belong to.
    pub fn selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();

        let spec = self.spec();
        spec.selector
            .match_labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.clone(), value.clone());
        spec.template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key, value);
        self
    }

    pub fn pod_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.spec()
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        self
    }

    pub fn pod_annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        self.spec()
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        self
    }

    pub fn pod_spec(mut self, pod_spec: PodSpec) -> Self {
        self.spec().template.spec = Some(pod_spec);
        self
    }

    fn spec(&mut self) -> &mut DeploymentSpec {
        self.deployment.spec.get_or_insert_with(|| DeploymentSpec {
            selector: LabelSelector::default(),
            ..Default::default()
        })
    }

    fn rolling_update(&mut self) -> &mut RollingUpdateDeployment {
        let strategy = self.spec().strategy.get_or_insert_with(|| DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            ..Default::default()
        });
        strategy.rolling_update.get_or_insert_with(Default::default)
    }
}

impl From<DeploymentBuilder> for Child {
    fn from(builder: DeploymentBuilder) -> Child {
        Child::Deployment(builder.deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    #[test]
    fn rolling_update_strategy() {
        let mut cluster =
            EtcdCluster::new("main", serde_json::from_str::<EtcdClusterSpec>("{}").unwrap());
        cluster.metadata.namespace = Some("etcd-system".to_string());

        let child: Child = Builder::new(&cluster)
            .deployment()
            .replicas(3)
            .max_unavailable(0)
            .max_surge(1)
            .selector("cluster", "main.etcd-system")
            .into();

        let Child::Deployment(deployment) = child else {
            panic!("expected deployment");
        };
        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));

        let rolling = spec.strategy.unwrap().rolling_update.unwrap();
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(0)));
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(1)));

        // selector is mirrored onto the pod template
        let template_labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.as_ref())
            .unwrap();
        assert_eq!(template_labels.get("cluster").unwrap(), "main.etcd-system");
        assert_eq!(
            spec.selector.match_labels.unwrap().get("cluster").unwrap(),
            "main.etcd-system"
        );
    }
}
