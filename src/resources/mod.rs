pub mod autoscaler;
pub mod common;
pub mod cron_job;
pub mod fe_proxy;
pub mod pod;
pub mod service;
pub mod statefulset;

pub use common::{
    API_VERSION, Be, Cn, ComponentKind, FIELD_MANAGER, Fe, FeProxy, KIND, component_labels,
    deterministic_hash, label_selector, owner_reference, standard_labels,
};
