//! Sync, status and cleanup shared by the StatefulSet-backed components

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod, Service};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::apply::{
    RESTART_STATE_ANNOTATION, RESTART_STATE_FINISHED, RESTART_STATE_RESTARTING, apply_object,
    apply_service, restart_state,
};
use crate::controller::client::{ClusterMetadataPatch, KubeClient, Propagation};
use crate::controller::components::SyncOutcome;
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::state_machine::{apply_partition, classify_pods};
use crate::controller::storage_expansion::sync_statefulset;
use crate::controller::wait::retry_write;
use crate::crd::{ComponentPhase, ComponentSpec, StarRocksCluster, StarRocksClusterStatus};
use crate::resources::autoscaler::{Autoscaler, generate_autoscaler};
use crate::resources::cron_job::{SCHEDULED_JOB_LABEL, generate_cron_jobs};
use crate::resources::pod::{ComponentParams, ComponentPorts};
use crate::resources::service::{generate_external_service, generate_search_service};
use crate::resources::statefulset::generate_statefulset;
use crate::resources::{ComponentKind, Fe, label_selector};
use crate::starrocks::{ConfigMapData, FePorts, parse_config};

/// Cluster annotation value requesting a rolling restart
pub const RESTART_REQUESTED: &str = "restart";

/// Cluster annotation value once a requested restart rolled out
pub const RESTART_FINISHED: &str = "restartFinished";

/// Load and parse the configuration file of a component.
///
/// A missing ConfigMap or key is not an error; every port falls back to
/// its default.
pub async fn load_component_config<C: KubeClient>(
    client: &C,
    namespace: &str,
    spec: &ComponentSpec,
) -> Result<ConfigMapData> {
    let Some(info) = spec.config_map_info.as_ref() else {
        return Ok(ConfigMapData::new());
    };
    let Some(config_map) = client
        .get::<ConfigMap>(namespace, &info.config_map_name)
        .await?
    else {
        warn!(config_map = %info.config_map_name, "ConfigMap not found, using default configuration");
        return Ok(ConfigMapData::new());
    };
    match config_map
        .data
        .as_ref()
        .and_then(|d| d.get(&info.resolve_key))
    {
        Some(text) => Ok(parse_config(text)),
        None => {
            warn!(
                config_map = %info.config_map_name,
                key = %info.resolve_key,
                "Configuration key not found, using default configuration"
            );
            Ok(ConfigMapData::new())
        }
    }
}

/// Ports of the cluster's FE, defaults when no FE is declared
pub async fn fe_ports<C: KubeClient>(client: &C, cluster: &StarRocksCluster) -> Result<FePorts> {
    let Some(spec) = Fe::spec(cluster) else {
        return Ok(FePorts::default());
    };
    let namespace = cluster.namespace().unwrap_or_default();
    let config = load_component_config(client, &namespace, spec).await?;
    Ok(FePorts::resolve(&config))
}

/// Whether the FE client-facing service has at least one ready address
pub async fn fe_endpoint_ready<C: KubeClient>(
    client: &C,
    cluster: &StarRocksCluster,
) -> Result<bool> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = Fe::external_service_name(&cluster.name_any());
    let Some(endpoints) = client.get::<Endpoints>(&namespace, &name).await? else {
        return Ok(false);
    };
    Ok(endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.addresses.as_ref().is_some_and(|a| !a.is_empty())))
}

/// Whether the cluster resource requests a rolling restart of `K`
pub fn restart_requested<K: ComponentKind>(cluster: &StarRocksCluster) -> bool {
    cluster
        .annotations()
        .get(&K::restart_annotation())
        .is_some_and(|v| v == RESTART_REQUESTED)
}

/// Synthesize and apply the services, StatefulSet, autoscaler and jobs of
/// a component
pub async fn sync_workload<K, C>(
    ctx: &Context<C>,
    cluster: &StarRocksCluster,
    spec: &ComponentSpec,
    ports: ComponentPorts,
    fe_ports: FePorts,
) -> Result<SyncOutcome>
where
    K: ComponentKind<Spec = ComponentSpec>,
    C: KubeClient,
{
    let client = &ctx.client;
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();

    let params = ComponentParams {
        cluster,
        spec,
        ports,
        fe_ports,
        labels: K::labels(&cluster_name),
        workload_name: K::default_resource_name(&cluster_name),
        search_service: K::search_service_name(&cluster_name),
        fe_service: Fe::external_service_name(&cluster_name),
    };
    let named_ports = ports.named_ports();

    let search = generate_search_service(
        cluster,
        &params.search_service,
        &params.labels,
        &named_ports,
    );
    apply_service(client, &ctx.cancel, &namespace, &search).await?;

    let external = generate_external_service(
        cluster,
        &K::external_service_name(&cluster_name),
        &params.labels,
        &named_ports,
        spec.service.as_ref(),
    );
    apply_service(client, &ctx.cancel, &namespace, &external).await?;

    let statefulset = generate_statefulset(&params);
    let storage_errors = sync_statefulset(
        client,
        &ctx.cancel,
        &ctx.expansion,
        statefulset,
        restart_requested::<K>(cluster),
    )
    .await?;

    sync_autoscaler::<K, C>(ctx, cluster, spec, &params).await?;
    sync_cron_jobs(ctx, &namespace, &params).await?;

    debug!(component = K::name(), "Component synced");
    if storage_errors.is_empty() {
        Ok(SyncOutcome::Synced)
    } else {
        Ok(SyncOutcome::SyncedWithWarnings(storage_errors))
    }
}

async fn sync_autoscaler<K, C>(
    ctx: &Context<C>,
    cluster: &StarRocksCluster,
    spec: &ComponentSpec,
    params: &ComponentParams<'_>,
) -> Result<()>
where
    K: ComponentKind<Spec = ComponentSpec>,
    C: KubeClient,
{
    let client = &ctx.client;
    let namespace = cluster.namespace().unwrap_or_default();
    let name = K::autoscaler_name(&cluster.name_any());

    let Some(policy) = spec.auto_scaling_policy.as_ref() else {
        if client
            .delete::<HorizontalPodAutoscaler>(&namespace, &name, Propagation::Background)
            .await?
        {
            info!(autoscaler = %name, "Removed autoscaler");
        }
        return Ok(());
    };

    match generate_autoscaler(cluster, &name, &params.workload_name, &params.labels, policy) {
        Autoscaler::V1(hpa) => apply_object(client, &ctx.cancel, &namespace, &hpa).await?,
        Autoscaler::V2(hpa) => apply_object(client, &ctx.cancel, &namespace, &hpa).await?,
    };
    Ok(())
}

/// Apply the declared CronJobs and delete the ones no longer declared
async fn sync_cron_jobs<C: KubeClient>(
    ctx: &Context<C>,
    namespace: &str,
    params: &ComponentParams<'_>,
) -> Result<()> {
    let client = &ctx.client;
    let desired = generate_cron_jobs(params);
    for job in &desired {
        apply_object(client, &ctx.cancel, namespace, job).await?;
    }

    let keep: BTreeSet<String> = desired.iter().map(|j| j.name_any()).collect();
    let existing: Vec<CronJob> = client
        .list(namespace, &label_selector(&params.labels))
        .await?;
    for job in existing {
        if job.labels().contains_key(SCHEDULED_JOB_LABEL) && !keep.contains(&job.name_any()) {
            client
                .delete::<CronJob>(namespace, &job.name_any(), Propagation::Background)
                .await?;
            info!(cron_job = %job.name_any(), "Removed scheduled job");
        }
    }
    Ok(())
}

/// Derive the status of a component from its live StatefulSet and pods
pub async fn update_workload_status<K, C>(
    ctx: &Context<C>,
    cluster: &StarRocksCluster,
    status: &mut StarRocksClusterStatus,
) -> Result<()>
where
    K: ComponentKind<Spec = ComponentSpec>,
    C: KubeClient,
{
    let Some(spec) = K::spec(cluster) else {
        *K::status_slot(status) = None;
        return Ok(());
    };

    let client = &ctx.client;
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let workload_name = K::default_resource_name(&cluster_name);
    let external = K::external_service_name(&cluster_name);

    let mut component = K::status_slot(status).take().unwrap_or_default();
    component.resource_names = vec![
        workload_name.clone(),
        K::search_service_name(&cluster_name),
        external.clone(),
    ];
    component.service_name = Some(external);
    component.horizontal_scaler = spec
        .auto_scaling_policy
        .as_ref()
        .map(|_| K::autoscaler_name(&cluster_name));

    match client.get::<StatefulSet>(&namespace, &workload_name).await? {
        None => {
            component.phase = ComponentPhase::Waiting;
            component.reason = Some("workload not created yet".to_string());
            component.running_instances.clear();
            component.creating_instances.clear();
            component.failed_instances.clear();
        }
        Some(sts) => {
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            let pods: Vec<Pod> = client
                .list(&namespace, &label_selector(&K::labels(&cluster_name)))
                .await?;
            apply_partition(&mut component, classify_pods(&pods), replicas);

            if component.phase == ComponentPhase::Running {
                finish_restart::<K, C>(ctx, cluster, &sts).await?;
            }
        }
    }

    *K::status_slot(status) = Some(component);
    Ok(())
}

/// Whether the StatefulSet controller has rolled the current template out
fn rollout_complete(sts: &StatefulSet) -> bool {
    let Some(status) = sts.status.as_ref() else {
        return false;
    };
    let observed = status.observed_generation.unwrap_or_default();
    observed >= sts.metadata.generation.unwrap_or_default()
        && status.update_revision.is_some()
        && status.update_revision == status.current_revision
}

/// Flip a rolled-out restart to finished.
///
/// The request annotation on the cluster moves first; once it no longer
/// asks for a restart, a stale workload marker cannot trigger a new one.
async fn finish_restart<K, C>(
    ctx: &Context<C>,
    cluster: &StarRocksCluster,
    sts: &StatefulSet,
) -> Result<()>
where
    K: ComponentKind<Spec = ComponentSpec>,
    C: KubeClient,
{
    if restart_state(sts) != Some(RESTART_STATE_RESTARTING) || !rollout_complete(sts) {
        return Ok(());
    }
    let client = &ctx.client;
    let namespace = cluster.namespace().unwrap_or_default();

    if restart_requested::<K>(cluster) {
        let patch = ClusterMetadataPatch {
            annotations: [(K::restart_annotation(), Some(RESTART_FINISHED.to_string()))]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        client
            .patch_cluster_metadata(&namespace, &cluster.name_any(), &patch)
            .await?;
    }

    let name = sts.name_any();
    let what = format!("finish restart of {}", name);
    retry_write(&ctx.cancel, &what, || {
        mark_restart_finished(client, &namespace, &name)
    })
    .await?;
    info!(component = K::name(), statefulset = %sts.name_any(), "Rolling restart finished");
    Ok(())
}

/// Flip the workload marker on a fresh read, since the StatefulSet
/// controller writes the object concurrently
async fn mark_restart_finished<C: KubeClient>(
    client: &C,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let Some(mut live) = client.get::<StatefulSet>(namespace, name).await? else {
        return Ok(());
    };
    if restart_state(&live) != Some(RESTART_STATE_RESTARTING) {
        return Ok(());
    }
    live.annotations_mut().insert(
        RESTART_STATE_ANNOTATION.to_string(),
        RESTART_STATE_FINISHED.to_string(),
    );
    client.replace(namespace, &live).await?;
    Ok(())
}

/// Delete every object of a component. Returns whether the StatefulSet is
/// gone.
pub async fn clear_workload<K, C>(ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<bool>
where
    K: ComponentKind<Spec = ComponentSpec>,
    C: KubeClient,
{
    let client = &ctx.client;
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let workload_name = K::default_resource_name(&cluster_name);

    let mut removed = client
        .delete::<StatefulSet>(&namespace, &workload_name, Propagation::Background)
        .await?;
    removed |= client
        .delete::<Service>(&namespace, &K::search_service_name(&cluster_name), Propagation::Background)
        .await?;
    removed |= client
        .delete::<Service>(&namespace, &K::external_service_name(&cluster_name), Propagation::Background)
        .await?;
    removed |= client
        .delete::<HorizontalPodAutoscaler>(
            &namespace,
            &K::autoscaler_name(&cluster_name),
            Propagation::Background,
        )
        .await?;

    let jobs: Vec<CronJob> = client
        .list(&namespace, &label_selector(&K::labels(&cluster_name)))
        .await?;
    for job in jobs.iter().filter(|j| j.labels().contains_key(SCHEDULED_JOB_LABEL)) {
        removed |= client
            .delete::<CronJob>(&namespace, &job.name_any(), Propagation::Background)
            .await?;
    }

    if removed {
        info!(component = K::name(), "Removed component resources");
    }
    Ok(client
        .get::<StatefulSet>(&namespace, &workload_name)
        .await?
        .is_none())
}
