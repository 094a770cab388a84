use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::client::KubeClient;
use crate::controller::components::workload::{
    clear_workload, fe_endpoint_ready, fe_ports, load_component_config, sync_workload,
    update_workload_status,
};
use crate::controller::components::{
    SubController, SyncOutcome, cleared, fe_unavailable, require_image,
};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::{StarRocksCluster, StarRocksClusterStatus};
use crate::resources::pod::ComponentPorts;
use crate::resources::{Cn, ComponentKind, Fe};
use crate::starrocks::{BackendPorts, NodeCredentials};

/// Elastic compute nodes; they register with the FE and must be dropped
/// from it before their pods go away
pub struct CnController;

#[async_trait]
impl<C: KubeClient> SubController<C> for CnController {
    fn component(&self) -> &'static str {
        Cn::name()
    }

    async fn sync(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<SyncOutcome> {
        let Some(spec) = Cn::spec(cluster) else {
            return Ok(cleared(self.clear_resources(ctx, cluster).await?));
        };
        require_image(Cn::name(), &spec.image)?;
        if !fe_endpoint_ready(&ctx.client, cluster).await? {
            debug!("CN waits for the FE service");
            return Ok(fe_unavailable());
        }

        let namespace = cluster.namespace().unwrap_or_default();
        let config = load_component_config(&ctx.client, &namespace, spec).await?;
        let fe_ports = fe_ports(&ctx.client, cluster).await?;
        let ports = ComponentPorts::Cn(BackendPorts::resolve_cn(&config));
        sync_workload::<Cn, C>(ctx, cluster, spec, ports, fe_ports).await
    }

    async fn update_status(
        &self,
        ctx: &Context<C>,
        cluster: &StarRocksCluster,
        status: &mut StarRocksClusterStatus,
    ) -> Result<()> {
        update_workload_status::<Cn, C>(ctx, cluster, status).await
    }

    async fn clear_resources(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<bool> {
        if !deregister_compute_nodes(ctx, cluster).await? {
            return Ok(false);
        }
        clear_workload::<Cn, C>(ctx, cluster).await
    }
}

/// Credentials from the cluster's credentials Secret, `root` without a
/// password when none is configured
async fn node_credentials<C: KubeClient>(
    client: &C,
    cluster: &StarRocksCluster,
) -> Result<NodeCredentials> {
    let Some(secret_name) = cluster.spec.credentials_secret.as_deref() else {
        return Ok(NodeCredentials::default());
    };
    let namespace = cluster.namespace().unwrap_or_default();
    let Some(secret) = client.get::<Secret>(&namespace, secret_name).await? else {
        warn!(secret = secret_name, "Credentials Secret not found, using defaults");
        return Ok(NodeCredentials::default());
    };

    let field = |key: &str| {
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| String::from_utf8(v.0.clone()).ok())
    };
    let defaults = NodeCredentials::default();
    Ok(NodeCredentials {
        user: field("username").unwrap_or(defaults.user),
        password: field("password").unwrap_or(defaults.password),
    })
}

/// Drop every compute node of this cluster from the FE registry.
///
/// Skipped when the cluster has no FE or the FE service has no ready
/// endpoints, since there is nothing left to deregister from. Returns
/// `false` when deregistration failed and should be retried.
pub async fn deregister_compute_nodes<C: KubeClient>(
    ctx: &Context<C>,
    cluster: &StarRocksCluster,
) -> Result<bool> {
    let client = &ctx.client;
    if Fe::spec(cluster).is_none() || !fe_endpoint_ready(client, cluster).await? {
        debug!("FE unavailable, skipping compute node deregistration");
        return Ok(true);
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let fe_ports = fe_ports(client, cluster).await?;
    let endpoint = format!(
        "http://{}.{}:{}",
        Fe::external_service_name(&cluster_name),
        namespace,
        fe_ports.http
    );
    let heartbeat_port = match Cn::spec(cluster) {
        Some(spec) => {
            BackendPorts::resolve_cn(&load_component_config(client, &namespace, spec).await?)
                .heartbeat
        }
        None => BackendPorts::resolve_cn(&Default::default()).heartbeat,
    };
    let domain = format!("{}.{}", Cn::search_service_name(&cluster_name), namespace);
    let credentials = node_credentials(client, cluster).await?;

    let nodes = match ctx.node_registry.list_nodes(&endpoint, &credentials).await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(error = %e, "Failed to list compute nodes");
            return Ok(false);
        }
    };

    for node in nodes.iter().filter(|n| n.ip.contains(&domain)) {
        let address = format!("{}:{}", node.ip, heartbeat_port);
        if let Err(e) = ctx
            .node_registry
            .drop_node(&endpoint, &credentials, &address)
            .await
        {
            warn!(node = %address, error = %e, "Failed to drop compute node");
            return Ok(false);
        }
        info!(node = %address, "Dropped compute node");
    }
    Ok(true)
}
