//! CronJob generation for component scheduled jobs

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::ScheduledJobSpec;
use crate::resources::common::{CLUSTER_LABEL, owner_reference};
use crate::resources::pod::{ComponentParams, component_env};

/// Label naming the scheduled job a CronJob implements
pub const SCHEDULED_JOB_LABEL: &str = "starrocks.com/scheduled-job";

/// CronJob name for a job of a component workload
pub fn cron_job_name(workload_name: &str, job: &str) -> String {
    format!("{}-{}", workload_name, job)
}

/// Generate one CronJob per scheduled job of the component
pub fn generate_cron_jobs(params: &ComponentParams) -> Vec<CronJob> {
    params
        .spec
        .scheduled_jobs
        .iter()
        .map(|job| generate_cron_job(params, job))
        .collect()
}

fn generate_cron_job(params: &ComponentParams, job: &ScheduledJobSpec) -> CronJob {
    let mut labels = params.labels.clone();
    labels.insert(SCHEDULED_JOB_LABEL.to_string(), job.name.clone());

    // Job pods must stay outside the workload's selector
    let pod_labels = BTreeMap::from([
        (CLUSTER_LABEL.to_string(), params.cluster.name_any()),
        (SCHEDULED_JOB_LABEL.to_string(), job.name.clone()),
    ]);

    let container = Container {
        name: job.name.clone(),
        image: Some(job.image.clone().unwrap_or_else(|| params.spec.image.clone())),
        command: Some(job.command.clone()),
        args: if job.args.is_empty() {
            None
        } else {
            Some(job.args.clone())
        },
        env: Some(component_env(params)),
        ..Default::default()
    };

    CronJob {
        metadata: ObjectMeta {
            name: Some(cron_job_name(&params.workload_name, &job.name)),
            namespace: params.cluster.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(params.cluster)]),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: job.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(3),
            failed_jobs_history_limit: Some(3),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    backoff_limit: Some(3),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(pod_labels),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![container],
                            restart_policy: Some("OnFailure".to_string()),
                            service_account_name: params.spec.service_account.clone(),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
