//! PodDisruptionBudget construction.

use std::collections::BTreeMap;

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::builder::{Builder, Child};

impl Builder {
    pub fn pod_disruption_budget(&self) -> PodDisruptionBudgetBuilder {
        PodDisruptionBudgetBuilder {
            pdb: PodDisruptionBudget {
                metadata: self.object_meta(&[]),
                spec: Some(PodDisruptionBudgetSpec::default()),
                ..Default::default()
            },
        }
    }
}

pub struct PodDisruptionBudgetBuilder {
    pdb: PodDisruptionBudget,
}

impl PodDisruptionBudgetBuilder {
    pub fn selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let spec = self.pdb.spec.get_or_insert_with(Default::default);
        spec.selector
            .get_or_insert_with(LabelSelector::default)
            .match_labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn max_unavailable(mut self, value: i32) -> Self {
        let spec = self.pdb.spec.get_or_insert_with(Default::default);
        spec.max_unavailable = Some(IntOrString::Int(value));
        self
    }
}

impl From<PodDisruptionBudgetBuilder> for Child {
    fn from(builder: PodDisruptionBudgetBuilder) -> Child {
        Child::PodDisruptionBudget(builder.pdb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    #[test]
    fn one_disruption_at_a_time() {
        let mut cluster =
            EtcdCluster::new("main", serde_json::from_str::<EtcdClusterSpec>("{}").unwrap());
        cluster.metadata.namespace = Some("etcd-system".to_string());

        let child: Child = Builder::new(&cluster)
            .pod_disruption_budget()
            .selector("cluster", "main.etcd-system")
            .max_unavailable(1)
            .into();

        let Child::PodDisruptionBudget(pdb) = child else {
            panic!("expected pdb");
        };
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.max_unavailable, Some(IntOrString::Int(1)));
        assert!(spec
            .selector
            .unwrap()
            .match_labels
            .unwrap()
            .contains_key("cluster"));
    }
}
