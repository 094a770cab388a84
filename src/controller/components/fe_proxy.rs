use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::controller::apply::{apply_deployment, apply_object, apply_service};
use crate::controller::client::{KubeClient, Propagation};
use crate::controller::components::workload::{fe_endpoint_ready, fe_ports};
use crate::controller::components::{
    SubController, SyncOutcome, cleared, fe_unavailable, require_image,
};
use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::controller::state_machine::{apply_partition, classify_pods};
use crate::crd::{ComponentPhase, FeProxySpec, StarRocksCluster, StarRocksClusterStatus};
use crate::resources::fe_proxy::{
    ProxyParams, generate_proxy_config_map, generate_proxy_deployment, generate_proxy_service,
    proxy_config_map_name,
};
use crate::resources::{ComponentKind, Fe, FeProxy, label_selector};

/// nginx proxy in front of the FE; waits for the FE like the backends
pub struct FeProxyController;

fn proxy_params<'a>(
    cluster: &'a StarRocksCluster,
    spec: &'a FeProxySpec,
    fe_http_port: i32,
) -> ProxyParams<'a> {
    let cluster_name = cluster.name_any();
    ProxyParams {
        cluster,
        spec,
        labels: FeProxy::labels(&cluster_name),
        name: FeProxy::default_resource_name(&cluster_name),
        fe_service: Fe::external_service_name(&cluster_name),
        fe_http_port,
    }
}

#[async_trait]
impl<C: KubeClient> SubController<C> for FeProxyController {
    fn component(&self) -> &'static str {
        FeProxy::name()
    }

    async fn sync(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<SyncOutcome> {
        let Some(spec) = FeProxy::spec(cluster) else {
            return Ok(cleared(self.clear_resources(ctx, cluster).await?));
        };
        require_image(FeProxy::name(), &spec.image)?;
        if !fe_endpoint_ready(&ctx.client, cluster).await? {
            debug!("FE proxy waits for the FE service");
            return Ok(fe_unavailable());
        }

        let client = &ctx.client;
        let namespace = cluster.namespace().unwrap_or_default();
        let fe_ports = fe_ports(client, cluster).await?;
        let params = proxy_params(cluster, spec, fe_ports.http);

        let cancel = &ctx.cancel;
        apply_object(client, cancel, &namespace, &generate_proxy_config_map(&params)).await?;
        apply_deployment(client, cancel, &namespace, &generate_proxy_deployment(&params)).await?;
        apply_service(client, cancel, &namespace, &generate_proxy_service(&params)).await?;
        Ok(SyncOutcome::Synced)
    }

    async fn update_status(
        &self,
        ctx: &Context<C>,
        cluster: &StarRocksCluster,
        status: &mut StarRocksClusterStatus,
    ) -> Result<()> {
        let Some(spec) = FeProxy::spec(cluster) else {
            *FeProxy::status_slot(status) = None;
            return Ok(());
        };

        let client = &ctx.client;
        let namespace = cluster.namespace().unwrap_or_default();
        let cluster_name = cluster.name_any();
        let params = proxy_params(cluster, spec, 0);

        let mut component = FeProxy::status_slot(status).take().unwrap_or_default();
        component.resource_names = vec![
            params.name.clone(),
            params.config_map_name(),
            params.service_name(),
        ];
        component.service_name = Some(params.service_name());

        match client.get::<Deployment>(&namespace, &params.name).await? {
            None => {
                component.phase = ComponentPhase::Waiting;
                component.reason = Some("workload not created yet".to_string());
                component.running_instances.clear();
                component.creating_instances.clear();
                component.failed_instances.clear();
            }
            Some(deployment) => {
                let replicas = deployment
                    .spec
                    .as_ref()
                    .and_then(|s| s.replicas)
                    .unwrap_or(1);
                let pods: Vec<Pod> = client
                    .list(&namespace, &label_selector(&FeProxy::labels(&cluster_name)))
                    .await?;
                apply_partition(&mut component, classify_pods(&pods), replicas);
            }
        }

        *FeProxy::status_slot(status) = Some(component);
        Ok(())
    }

    async fn clear_resources(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<bool> {
        let client = &ctx.client;
        let namespace = cluster.namespace().unwrap_or_default();
        let cluster_name = cluster.name_any();
        let name = FeProxy::default_resource_name(&cluster_name);

        let mut removed = client
            .delete::<Deployment>(&namespace, &name, Propagation::Background)
            .await?;
        removed |= client
            .delete::<ConfigMap>(
                &namespace,
                &proxy_config_map_name(&name),
                Propagation::Background,
            )
            .await?;
        removed |= client
            .delete::<Service>(
                &namespace,
                &FeProxy::external_service_name(&cluster_name),
                Propagation::Background,
            )
            .await?;
        if removed {
            info!("Removed FE proxy resources");
        }

        Ok(client.get::<Deployment>(&namespace, &name).await?.is_none())
    }
}
