//! Per-component sub-controllers
//!
//! Each sub-controller owns the objects of one component: it synthesizes
//! and applies them, derives the component status, and removes them when
//! the component disappears from the spec or the cluster is deleted.

mod be;
mod cn;
mod fe;
mod fe_proxy;
pub mod workload;

use async_trait::async_trait;

use crate::controller::client::KubeClient;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::{StarRocksCluster, StarRocksClusterStatus};

pub use be::BeController;
pub use cn::{CnController, deregister_compute_nodes};
pub use fe::FeController;
pub use fe_proxy::FeProxyController;
pub use workload::{RESTART_FINISHED, RESTART_REQUESTED, fe_endpoint_ready, load_component_config};

/// Result of one sync
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every object matches the spec
    Synced,
    /// Synced, but some volume changes were refused
    SyncedWithWarnings(Vec<String>),
    /// A precondition is not met yet; nothing was written
    Waiting(String),
}

impl SyncOutcome {
    /// Refused volume changes reported by the sync
    pub fn warnings(&self) -> &[String] {
        match self {
            SyncOutcome::SyncedWithWarnings(warnings) => warnings,
            _ => &[],
        }
    }
}

/// Lifecycle of one component kind
#[async_trait]
pub trait SubController<C: KubeClient>: Send + Sync {
    /// Component short name
    fn component(&self) -> &'static str;

    /// Converge the component's objects to the spec, or remove them when
    /// the component is not declared
    async fn sync(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<SyncOutcome>;

    /// Write the component's slot of `status` from live state
    async fn update_status(
        &self,
        ctx: &Context<C>,
        cluster: &StarRocksCluster,
        status: &mut StarRocksClusterStatus,
    ) -> Result<()>;

    /// Delete the component's objects. Returns whether cleanup is complete.
    async fn clear_resources(&self, ctx: &Context<C>, cluster: &StarRocksCluster) -> Result<bool>;
}

/// Sub-controllers in dependency order: the FE first, since every other
/// component reaches it through its service
pub fn default_controllers<C: KubeClient>() -> Vec<Box<dyn SubController<C>>> {
    vec![
        Box::new(FeController),
        Box::new(BeController),
        Box::new(CnController),
        Box::new(FeProxyController),
    ]
}

fn cleared(complete: bool) -> SyncOutcome {
    if complete {
        SyncOutcome::Synced
    } else {
        SyncOutcome::Waiting("waiting for removed component to be cleaned up".to_string())
    }
}

/// A declared component cannot run without an image
fn require_image(component: &str, image: &str) -> Result<()> {
    if image.trim().is_empty() {
        return Err(Error::ValidationError(format!(
            "{} is declared without an image",
            component
        )));
    }
    Ok(())
}

fn fe_unavailable() -> SyncOutcome {
    SyncOutcome::Waiting("FE service has no ready endpoints".to_string())
}
