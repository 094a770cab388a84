//! StarRocks-specific knowledge: configuration files and node registration

pub mod config;
pub mod nodes;

pub use config::{BackendPorts, ConfigMapData, FePorts, parse_config, resolve_port};
pub use nodes::{HttpNodeRegistry, NodeCredentials, NodeRegistry, RegisteredNode};
