//! Reconciliation logic for StarRocksCluster resources
//!
//! One pass syncs every component in dependency order, then derives the
//! status of each component and of the cluster from live state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::client::{ClusterMetadataPatch, KubeClient};
use crate::controller::components::SyncOutcome;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::derive_cluster_phase;
use crate::controller::status::{StatusManager, spec_changed};
use crate::crd::{ClusterPhase, StarRocksCluster};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "starrocks.com/finalizer";

/// Requeue interval while components converge
const PENDING_REQUEUE: Duration = Duration::from_secs(10);

/// Requeue interval once everything runs
const RUNNING_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue interval while deletion waits for cleanup
const CLEANUP_REQUEUE: Duration = Duration::from_secs(5);

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile<C: KubeClient>(
    cluster: Arc<StarRocksCluster>,
    ctx: Arc<Context<C>>,
) -> Result<Action> {
    let started = Instant::now();
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let result = if cluster.metadata.deletion_timestamp.is_some() {
        handle_deletion(&cluster, &ctx).await
    } else {
        reconcile_cluster(&cluster, &ctx).await
    };

    if let Some(state) = &ctx.health_state {
        match &result {
            Ok(_) => state
                .metrics
                .record_reconcile(&ns, &name, started.elapsed().as_secs_f64()),
            Err(_) => state.metrics.record_error(&ns, &name),
        }
    }
    result
}

/// Error policy for the controller with exponential backoff
pub fn error_policy<C: KubeClient>(
    cluster: Arc<StarRocksCluster>,
    error: &Error,
    ctx: Arc<Context<C>>,
) -> Action {
    let name = cluster.name_any();
    let delay = ctx.backoff.delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

fn has_finalizer(cluster: &StarRocksCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

async fn add_finalizer<C: KubeClient>(cluster: &StarRocksCluster, ctx: &Context<C>) -> Result<()> {
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = ClusterMetadataPatch {
        finalizers: Some(finalizers),
        ..Default::default()
    };
    ctx.client
        .patch_cluster_metadata(
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            &patch,
        )
        .await?;
    info!("Added finalizer");
    Ok(())
}

async fn remove_finalizer<C: KubeClient>(
    cluster: &StarRocksCluster,
    ctx: &Context<C>,
) -> Result<()> {
    let finalizers: Vec<String> = cluster
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    let patch = ClusterMetadataPatch {
        finalizers: Some(finalizers),
        ..Default::default()
    };
    ctx.client
        .patch_cluster_metadata(
            &cluster.namespace().unwrap_or_default(),
            &cluster.name_any(),
            &patch,
        )
        .await?;
    info!("Removed finalizer");
    Ok(())
}

/// Remove every component in reverse dependency order, then release the
/// finalizer.
///
/// A component whose cleanup is still pending keeps everything it depends
/// on in place until a later pass.
async fn handle_deletion<C: KubeClient>(
    cluster: &StarRocksCluster,
    ctx: &Context<C>,
) -> Result<Action> {
    if !has_finalizer(cluster) {
        return Ok(Action::await_change());
    }
    info!("Cleaning up deleted StarRocksCluster");

    let status_manager = StatusManager::new(cluster, &ctx.client);
    if let Err(e) = status_manager.set_deleting().await {
        // The object may be gone already
        debug!(error = %e, "Could not record deleting phase");
    }

    for controller in ctx.controllers.iter().rev() {
        if !controller.clear_resources(ctx, cluster).await? {
            debug!(component = controller.component(), "Cleanup not complete");
            return Ok(Action::requeue(CLEANUP_REQUEUE));
        }
    }

    remove_finalizer(cluster, ctx).await?;
    Ok(Action::await_change())
}

async fn reconcile_cluster<C: KubeClient>(
    cluster: &StarRocksCluster,
    ctx: &Context<C>,
) -> Result<Action> {
    if !has_finalizer(cluster) {
        add_finalizer(cluster, ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if spec_changed(cluster) {
        info!(
            generation = ?cluster.metadata.generation,
            observed = ?cluster.status.as_ref().and_then(|s| s.observed_generation),
            "Spec changed, reconciling"
        );
    }

    let status_manager = StatusManager::new(cluster, &ctx.client);
    let mut storage_errors = Vec::new();

    for controller in &ctx.controllers {
        match controller.sync(ctx, cluster).await {
            Ok(SyncOutcome::Waiting(reason)) => {
                debug!(component = controller.component(), %reason, "Component waiting");
            }
            Ok(outcome) => storage_errors.extend(outcome.warnings().iter().cloned()),
            Err(e) => {
                error!(component = controller.component(), error = %e, "Component sync failed");
                let message = format!("{} sync failed: {}", controller.component(), e);
                if let Err(status_err) = status_manager.set_failed(&message).await {
                    warn!(error = %status_err, "Failed to record failed phase");
                }
                return Err(e);
            }
        }
    }

    let mut status = status_manager.current();
    for controller in &ctx.controllers {
        controller.update_status(ctx, cluster, &mut status).await?;
    }
    let (phase, reason) = derive_cluster_phase(status.components());

    if let Some(state) = &ctx.health_state {
        let ns = cluster.namespace().unwrap_or_default();
        let name = cluster.name_any();
        state.metrics.set_cluster_phase(&ns, &name, phase);
        for controller in &ctx.controllers {
            let ready = status
                .component(controller.component())
                .map(|s| s.running_instances.len() as i64)
                .unwrap_or(0);
            state
                .metrics
                .set_component_ready(&ns, &name, controller.component(), ready);
        }
    }

    status_manager
        .set_phase(status, phase, reason, &storage_errors)
        .await?;

    info!(%phase, "Reconciliation completed");
    Ok(match phase {
        ClusterPhase::Running => Action::requeue(RUNNING_REQUEUE),
        _ => Action::requeue(PENDING_REQUEUE),
    })
}
