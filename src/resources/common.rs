//! Common utilities for Kubernetes resource generation
//!
//! Shared naming, labelling and ownership helpers used by every resource
//! generator, plus the [`ComponentKind`] capability that ties a component to
//! its spec, status slot and naming convention.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::crd::{
    ComponentSpec, ComponentStatus, FeProxySpec, ResourceList, ResourceRequirements,
    StarRocksCluster, StarRocksClusterStatus,
};

/// API version for StarRocksCluster CRD
pub const API_VERSION: &str = "starrocks.com/v1";

/// Kind for StarRocksCluster CRD
pub const KIND: &str = "StarRocksCluster";

/// Operator field manager name
pub const FIELD_MANAGER: &str = "starrocks-operator";

/// Label carrying the owning cluster name
pub const CLUSTER_LABEL: &str = "starrocks.com/cluster";

/// Label carrying the component name
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Generate an owner reference for a StarRocksCluster
///
/// Child resources are garbage collected when the cluster is deleted.
pub fn owner_reference(cluster: &StarRocksCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Generate standard labels for all resources belonging to a StarRocksCluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "starrocks".to_string()),
        (
            "app.kubernetes.io/instance".to_string(),
            cluster_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels selecting the pods of one component
pub fn component_labels(cluster_name: &str, component: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(COMPONENT_LABEL.to_string(), component.to_string());
    labels
}

/// Render labels as a label selector (`k=v,k=v`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert CRD resource requirements into the Kubernetes type
pub fn resource_requirements(resources: Option<&ResourceRequirements>) -> Option<K8sResourceRequirements> {
    let resources = resources?;
    let to_map = |list: &ResourceList| {
        let mut map = BTreeMap::new();
        if let Some(cpu) = &list.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &list.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    };
    Some(K8sResourceRequirements {
        limits: resources.limits.as_ref().map(to_map),
        requests: resources.requests.as_ref().map(to_map),
        ..Default::default()
    })
}

/// `None` for an empty map, so generated objects stay minimal
pub fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() { None } else { Some(map) }
}

/// Stable hex digest of `input`.
///
/// Truncated to 16 bytes, which keeps annotation values short.
pub fn deterministic_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest[..16].iter().fold(String::with_capacity(32), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// One role within a StarRocks cluster.
///
/// Implemented by zero-sized markers so the naming convention and spec slot
/// of a component are picked at compile time.
pub trait ComponentKind: Send + Sync + 'static {
    /// Spec record of the component
    type Spec: Clone + Send + Sync;

    /// Short component name used in resource names and labels
    fn name() -> &'static str;

    /// The component's spec, if the cluster declares it
    fn spec(cluster: &StarRocksCluster) -> Option<&Self::Spec>;

    /// The component's status slot
    fn status_slot(status: &mut StarRocksClusterStatus) -> &mut Option<ComponentStatus>;

    /// Name of the main workload
    fn default_resource_name(cluster_name: &str) -> String {
        format!("{}-{}", cluster_name, Self::name())
    }

    /// Labels carried by the component's pods and used as its selector
    fn labels(cluster_name: &str) -> BTreeMap<String, String> {
        component_labels(cluster_name, Self::name())
    }

    /// Headless service used for stable pod DNS
    fn search_service_name(cluster_name: &str) -> String {
        format!("{}-search", Self::default_resource_name(cluster_name))
    }

    /// Client-facing service
    fn external_service_name(cluster_name: &str) -> String {
        format!("{}-service", Self::default_resource_name(cluster_name))
    }

    /// Horizontal autoscaler name
    fn autoscaler_name(cluster_name: &str) -> String {
        format!("{}-autoscaler", Self::default_resource_name(cluster_name))
    }

    /// Annotation on the cluster resource requesting a rolling restart
    fn restart_annotation() -> String {
        format!("starrocks.com/restart-{}", Self::name())
    }
}

/// Front-end (metadata) nodes
pub struct Fe;
/// Back-end (storage and compute) nodes
pub struct Be;
/// Elastic compute nodes
pub struct Cn;
/// nginx proxy in front of the FE
pub struct FeProxy;

impl ComponentKind for Fe {
    type Spec = ComponentSpec;

    fn name() -> &'static str {
        "fe"
    }

    fn spec(cluster: &StarRocksCluster) -> Option<&ComponentSpec> {
        cluster.spec.star_rocks_fe_spec.as_ref()
    }

    fn status_slot(status: &mut StarRocksClusterStatus) -> &mut Option<ComponentStatus> {
        &mut status.star_rocks_fe_status
    }
}

impl ComponentKind for Be {
    type Spec = ComponentSpec;

    fn name() -> &'static str {
        "be"
    }

    fn spec(cluster: &StarRocksCluster) -> Option<&ComponentSpec> {
        cluster.spec.star_rocks_be_spec.as_ref()
    }

    fn status_slot(status: &mut StarRocksClusterStatus) -> &mut Option<ComponentStatus> {
        &mut status.star_rocks_be_status
    }
}

impl ComponentKind for Cn {
    type Spec = ComponentSpec;

    fn name() -> &'static str {
        "cn"
    }

    fn spec(cluster: &StarRocksCluster) -> Option<&ComponentSpec> {
        cluster.spec.star_rocks_cn_spec.as_ref()
    }

    fn status_slot(status: &mut StarRocksClusterStatus) -> &mut Option<ComponentStatus> {
        &mut status.star_rocks_cn_status
    }
}

impl ComponentKind for FeProxy {
    type Spec = FeProxySpec;

    fn name() -> &'static str {
        "fe-proxy"
    }

    fn spec(cluster: &StarRocksCluster) -> Option<&FeProxySpec> {
        cluster.spec.star_rocks_fe_proxy_spec.as_ref()
    }

    fn status_slot(status: &mut StarRocksClusterStatus) -> &mut Option<ComponentStatus> {
        &mut status.star_rocks_fe_proxy_status
    }
}
