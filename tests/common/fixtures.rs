//! Test fixtures and builders for StarRocksCluster resources
//!
//! ```rust,ignore
//! let cluster = ClusterBuilder::new("kube", "db").with_fe(3).with_be(3).build();
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateWaiting, ContainerStatus, EndpointAddress, EndpointSubset,
    Endpoints, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodStatus, Volume,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use tokio_util::sync::CancellationToken;

use starrocks_operator::controller::client::DEFAULT_STORAGE_CLASS_ANNOTATION;
use starrocks_operator::controller::wait::PollConfig;
use starrocks_operator::controller::{Context, ExpansionConfig, FINALIZER};
use starrocks_operator::crd::{
    ComponentSpec, FeProxySpec, StarRocksCluster, StarRocksClusterSpec, StorageVolume,
};
use starrocks_operator::resources::pod::{ComponentParams, ComponentPorts};
use starrocks_operator::resources::statefulset::generate_statefulset;
use starrocks_operator::resources::{Be, ComponentKind, Fe};
use starrocks_operator::starrocks::{BackendPorts, FePorts, NodeRegistry};

use super::{FakeClient, FakeNodeRegistry};

pub const FE_IMAGE: &str = "starrocks/fe-ubuntu:3.3";
pub const BE_IMAGE: &str = "starrocks/be-ubuntu:3.3";
pub const CN_IMAGE: &str = "starrocks/cn-ubuntu:3.3";

/// Builder for StarRocksCluster test resources.
///
/// Clusters carry the operator finalizer unless told otherwise, so a single
/// reconcile pass goes straight to syncing components.
pub struct ClusterBuilder {
    cluster: StarRocksCluster,
}

impl ClusterBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        Self {
            cluster: StarRocksCluster {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    uid: Some("test-uid-12345".to_string()),
                    generation: Some(1),
                    finalizers: Some(vec![FINALIZER.to_string()]),
                    ..Default::default()
                },
                spec: StarRocksClusterSpec::default(),
                status: None,
            },
        }
    }

    pub fn without_finalizer(mut self) -> Self {
        self.cluster.metadata.finalizers = None;
        self
    }

    pub fn with_fe(mut self, replicas: i32) -> Self {
        self.cluster.spec.star_rocks_fe_spec = Some(component_spec(FE_IMAGE, Some(replicas)));
        self
    }

    pub fn with_be(mut self, replicas: i32) -> Self {
        self.cluster.spec.star_rocks_be_spec = Some(component_spec(BE_IMAGE, Some(replicas)));
        self
    }

    pub fn with_be_spec(mut self, spec: ComponentSpec) -> Self {
        self.cluster.spec.star_rocks_be_spec = Some(spec);
        self
    }

    pub fn with_cn(mut self, replicas: i32) -> Self {
        self.cluster.spec.star_rocks_cn_spec = Some(component_spec(CN_IMAGE, Some(replicas)));
        self
    }

    pub fn with_cn_spec(mut self, spec: ComponentSpec) -> Self {
        self.cluster.spec.star_rocks_cn_spec = Some(spec);
        self
    }

    pub fn with_fe_proxy(mut self) -> Self {
        self.cluster.spec.star_rocks_fe_proxy_spec = Some(FeProxySpec {
            image: "nginx:1.27".to_string(),
            replicas: Some(1),
            ..Default::default()
        });
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.cluster
            .annotations_mut()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_credentials_secret(mut self, name: &str) -> Self {
        self.cluster.spec.credentials_secret = Some(name.to_string());
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.cluster.metadata.generation = Some(generation);
        self
    }

    /// Mark the cluster as being deleted
    pub fn deleting(mut self) -> Self {
        self.cluster.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        self
    }

    pub fn build(self) -> StarRocksCluster {
        self.cluster
    }
}

/// A component spec with a fixed replica count and no volumes
pub fn component_spec(image: &str, replicas: Option<i32>) -> ComponentSpec {
    ComponentSpec {
        image: image.to_string(),
        replicas,
        ..Default::default()
    }
}

/// A persistent volume of `size` in storage class `class`
pub fn storage_volume(name: &str, class: Option<&str>, size: &str) -> StorageVolume {
    StorageVolume {
        name: name.to_string(),
        storage_class_name: class.map(str::to_string),
        storage_size: size.to_string(),
        mount_path: format!("/opt/starrocks/be/{}", name),
        host_path: None,
    }
}

/// A context over the fake client with expansion waits shortened to
/// milliseconds
pub fn test_context(client: FakeClient, registry: Arc<FakeNodeRegistry>) -> Context<FakeClient> {
    let registry: Arc<dyn NodeRegistry> = registry;
    Context::with_client(client, registry, None, CancellationToken::new())
        .with_expansion(fast_expansion())
}

/// Expansion waits that give up after a few milliseconds
pub fn fast_expansion() -> ExpansionConfig {
    let fast = PollConfig::new(Duration::from_millis(1), 5);
    ExpansionConfig {
        workload_deletion: fast,
        detach: fast,
        resize: fast,
    }
}

fn pod_meta(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

/// A running pod whose single container is ready
pub fn ready_pod(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> Pod {
    Pod {
        metadata: pod_meta(name, namespace, labels),
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// A pod still pulling its image
pub fn pending_pod(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> Pod {
    Pod {
        metadata: pod_meta(name, namespace, labels),
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            phase: Some("Pending".to_string()),
            ..Default::default()
        }),
    }
}

/// A pod whose container keeps crashing
pub fn crashing_pod(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> Pod {
    Pod {
        metadata: pod_meta(name, namespace, labels),
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![ContainerStatus {
                name: "main".to_string(),
                ready: false,
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// A ready pod mounting the given claims
pub fn pod_with_claims(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    claims: &[&str],
) -> Pod {
    let mut pod = ready_pod(name, namespace, labels);
    pod.spec = Some(PodSpec {
        volumes: Some(
            claims
                .iter()
                .map(|claim| Volume {
                    name: claim.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    });
    pod
}

/// Seed `count` ready pods for component `K` of a cluster
pub fn seed_ready_pods<K: ComponentKind>(
    client: &FakeClient,
    cluster: &StarRocksCluster,
    count: usize,
) {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let labels = K::labels(&cluster_name);
    for i in 0..count {
        let name = format!("{}-{}", K::default_resource_name(&cluster_name), i);
        client.insert(&namespace, ready_pod(&name, &namespace, &labels));
    }
}

/// Endpoints of the FE client-facing service with one ready address
pub fn ready_fe_endpoints(cluster: &StarRocksCluster) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(Fe::external_service_name(&cluster.name_any())),
            namespace: cluster.namespace(),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(vec![EndpointAddress {
                ip: "10.0.0.10".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

/// A StorageClass for `provisioner`
pub fn storage_class(name: &str, provisioner: &str, allow_expansion: bool) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        allow_volume_expansion: Some(allow_expansion),
        ..Default::default()
    }
}

/// A StorageClass marked as the cluster default
pub fn default_storage_class(name: &str, provisioner: &str, allow_expansion: bool) -> StorageClass {
    let mut sc = storage_class(name, provisioner, allow_expansion);
    sc.metadata.annotations = Some(BTreeMap::from([(
        DEFAULT_STORAGE_CLASS_ANNOTATION.to_string(),
        "true".to_string(),
    )]));
    sc
}

/// A bound claim with capacity equal to its request
pub fn bound_pvc(name: &str, namespace: &str, size: &str, class: Option<&str>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: class.map(str::to_string),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(size.to_string()),
            )])),
            ..Default::default()
        }),
    }
}

/// The BE StatefulSet the operator would generate for `cluster`
pub fn be_statefulset(cluster: &StarRocksCluster) -> StatefulSet {
    let cluster_name = cluster.name_any();
    let spec = cluster
        .spec
        .star_rocks_be_spec
        .as_ref()
        .expect("cluster declares a BE");
    let params = ComponentParams {
        cluster,
        spec,
        ports: ComponentPorts::Be(BackendPorts::resolve_be(&Default::default())),
        fe_ports: FePorts::default(),
        labels: Be::labels(&cluster_name),
        workload_name: Be::default_resource_name(&cluster_name),
        search_service: Be::search_service_name(&cluster_name),
        fe_service: Fe::external_service_name(&cluster_name),
    };
    generate_statefulset(&params)
}

/// BE cluster with one `data` volume of `size` in class `class`
pub fn be_cluster_with_volume(replicas: i32, class: Option<&str>, size: &str) -> StarRocksCluster {
    let mut spec = component_spec(BE_IMAGE, Some(replicas));
    spec.storage_volumes = vec![storage_volume("data", class, size)];
    ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_be_spec(spec)
        .build()
}
