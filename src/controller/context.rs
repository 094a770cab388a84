use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::controller::client::{KubeApiClient, KubeClient};
use crate::controller::components::{self, SubController};
use crate::controller::error::BackoffConfig;
use crate::controller::storage_expansion::ExpansionConfig;
use crate::health::HealthState;
use crate::starrocks::{HttpNodeRegistry, NodeRegistry};

/// Shared context for the controller
pub struct Context<C: KubeClient = KubeApiClient> {
    /// Kubernetes client
    pub client: C,
    /// Sub-controllers in dependency order
    pub controllers: Vec<Box<dyn SubController<C>>>,
    /// FE node registry used to deregister compute nodes
    pub node_registry: Arc<dyn NodeRegistry>,
    /// Wait budgets of storage expansion
    pub expansion: ExpansionConfig,
    /// Requeue backoff
    pub backoff: BackoffConfig,
    /// Cancelled on shutdown; aborts long waits
    pub cancel: CancellationToken,
    /// Health state for metrics recording (optional)
    pub health_state: Option<Arc<HealthState>>,
}

impl Context<KubeApiClient> {
    pub fn new(
        client: Client,
        health_state: Option<Arc<HealthState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_client(
            KubeApiClient::new(client),
            Arc::new(HttpNodeRegistry::new()),
            health_state,
            cancel,
        )
    }
}

impl<C: KubeClient> Context<C> {
    /// Context over any client and node registry
    pub fn with_client(
        client: C,
        node_registry: Arc<dyn NodeRegistry>,
        health_state: Option<Arc<HealthState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            controllers: components::default_controllers(),
            node_registry,
            expansion: ExpansionConfig::default(),
            backoff: BackoffConfig::default(),
            cancel,
            health_state,
        }
    }

    /// Override the storage expansion wait budgets
    pub fn with_expansion(mut self, expansion: ExpansionConfig) -> Self {
        self.expansion = expansion;
        self
    }
}
