use async_trait::async_trait;
use kube::ResourceExt;
use tracing::debug;

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
use crate::resources::{Be, ComponentKind};
use crate::starrocks::BackendPorts;

/// Back-end nodes; they register with the FE and wait for it
pub struct BeController;

#[async_trait]
impl<C: KubeClient> SubController<C> for BeController {
    fn component(&self) -> &'static str {
        Be::name()
    }

    async fn sync(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<SyncOutcome> {
        let Some(spec) = Be::spec(cluster) else {
            return Ok(cleared(self.clear_resources(ctx, cluster).await?));
        };
        require_image(Be::name(), &spec.image)?;
        if !fe_endpoint_ready(&ctx.client, cluster).await? {
            debug!("BE waits for the FE service");
            return Ok(fe_unavailable());
        }

        let namespace = cluster.namespace().unwrap_or_default();
        let config = load_component_config(&ctx.client, &namespace, spec).await?;
        let fe_ports = fe_ports(&ctx.client, cluster).await?;
        let ports = ComponentPorts::Be(BackendPorts::resolve_be(&config));
        sync_workload::<Be, C>(ctx, cluster, spec, ports, fe_ports).await
    }

    async fn update_status(
        &self,
        ctx: &Context<C>,
        cluster: &StarRocksCluster,
        status: &mut StarRocksClusterStatus,
    ) -> Result<()> {
        update_workload_status::<Be, C>(ctx, cluster, status).await
    }

    async fn clear_resources(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<bool> {
        clear_workload::<Be, C>(ctx, cluster).await
    }
}
