//! CronJob construction for scheduled maintenance jobs.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec};
use k8s_openapi::api::core::v1::PodSpec;

use super::builder::{Builder, Child};

impl Builder {
    pub fn cron_job(&self, name: &str) -> CronJobBuilder {
        CronJobBuilder {
            cron_job: CronJob {
                metadata: self.object_meta(&[name]),
                spec: Some(CronJobSpec::default()),
                ..Default::default()
            },
        }
    }
}

pub struct CronJobBuilder {
    cron_job: CronJob,
}

impl CronJobBuilder {
    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.spec().schedule = schedule.into();
        self
    }

    pub fn suspend(mut self, suspend: bool) -> Self {
        self.spec().suspend = Some(suspend);
        self
    }

    pub fn forbid_concurrent(mut self) -> Self {
        self.spec().concurrency_policy = Some("Forbid".to_string());
        self
    }

    /// Finished jobs are garbage collected after this long
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.job_spec().ttl_seconds_after_finished = Some(ttl.as_secs() as i32);
        self
    }

    /// Running jobs are killed past this deadline
    pub fn active_deadline(mut self, deadline: Duration) -> Self {
        self.job_spec().active_deadline_seconds = Some(deadline.as_secs() as i64);
        self
    }

    pub fn pod_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.job_spec()
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
        self
    }

    pub fn pod_annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        self.job_spec()
            .template
            .metadata
            .get_or_insert_with(Default::default)
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
        self
    }

    pub fn pod_spec(mut self, pod_spec: PodSpec) -> Self {
        self.job_spec().template.spec = Some(pod_spec);
        self
    }

    fn spec(&mut self) -> &mut CronJobSpec {
        self.cron_job.spec.get_or_insert_with(Default::default)
    }

    fn job_spec(&mut self) -> &mut JobSpec {
        self.spec().job_template.spec.get_or_insert_with(Default::default)
    }
}

impl From<CronJobBuilder> for Child {
    fn from(builder: CronJobBuilder) -> Child {
        Child::CronJob(builder.cron_job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{EtcdCluster, EtcdClusterSpec};

    #[test]
    fn cron_job_policies() {
        let mut cluster =
            EtcdCluster::new("main", serde_json::from_str::<EtcdClusterSpec>("{}").unwrap());
        cluster.metadata.namespace = Some("etcd-system".to_string());

        let child: Child = Builder::new(&cluster)
            .cron_job("defrag")
            .schedule("0 1 * * *")
            .suspend(false)
            .forbid_concurrent()
            .ttl(Duration::from_secs(24 * 60 * 60))
            .active_deadline(Duration::from_secs(5 * 60))
            .into();

        assert_eq!(child.meta().name.as_deref(), Some("main-defrag"));

        let Child::CronJob(cron_job) = child else {
            panic!("expected cron job");
        };
        let spec = cron_job.spec.unwrap();
        assert_eq!(spec.schedule, "0 1 * * *");
        assert_eq!(spec.concurrency_policy.as_deref(), Some("Forbid"));

        let job_spec = spec.job_template.spec.unwrap();
        assert_eq!(job_spec.ttl_seconds_after_finished, Some(86400));
        assert_eq!(job_spec.active_deadline_seconds, Some(300));
    }
}
