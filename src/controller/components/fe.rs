use async_trait::async_trait;
use kube::ResourceExt;

use crate::controller::client::KubeClient;
use crate::controller::components::workload::{
    clear_workload, load_component_config, sync_workload, update_workload_status,
};
use crate::controller::components::{SubController, SyncOutcome, cleared, require_image};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::{StarRocksCluster, StarRocksClusterStatus};
use crate::resources::pod::ComponentPorts;
use crate::resources::{ComponentKind, Fe};
use crate::starrocks::FePorts;

/// Front-end nodes; no upstream dependency
pub struct FeController;

#[async_trait]
impl<C: KubeClient> SubController<C> for FeController {
    fn component(&self) -> &'static str {
        Fe::name()
    }

    async fn sync(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<SyncOutcome> {
        let Some(spec) = Fe::spec(cluster) else {
            return Ok(cleared(self.clear_resources(ctx, cluster).await?));
        };
        require_image(Fe::name(), &spec.image)?;
        let namespace = cluster.namespace().unwrap_or_default();
        let config = load_component_config(&ctx.client, &namespace, spec).await?;
        let ports = FePorts::resolve(&config);
        sync_workload::<Fe, C>(ctx, cluster, spec, ComponentPorts::Fe(ports), ports).await
    }

    async fn update_status(
        &self,
        ctx: &Context<C>,
        cluster: &StarRocksCluster,
        status: &mut StarRocksClusterStatus,
    ) -> Result<()> {
        update_workload_status::<Fe, C>(ctx, cluster, status).await
    }

    async fn clear_resources(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<bool> {
        clear_workload::<Fe, C>(ctx, cluster).await
    }
}
