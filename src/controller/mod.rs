pub mod apply;
pub mod client;
pub mod components;
pub mod context;
pub mod error;
pub mod reconciler;
pub mod state_machine;
pub mod status;
pub mod storage_expansion;
pub mod wait;

pub use client::{KubeApiClient, KubeClient, Propagation};
pub use components::{SubController, SyncOutcome};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use status::{ConditionBuilder, StatusManager, spec_changed};
pub use storage_expansion::{ExpansionConfig, ExpansionPlan, PvcExpansion};
