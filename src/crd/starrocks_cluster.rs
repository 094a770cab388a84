use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// StarRocksCluster is the Schema for the starrocksclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "starrocks.com",
    version = "v1",
    kind = "StarRocksCluster",
    plural = "starrocksclusters",
    shortname = "src",
    namespaced,
    status = "StarRocksClusterStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"FE", "type":"string", "jsonPath":".status.starRocksFeStatus.phase"}"#,
    printcolumn = r#"{"name":"BE", "type":"string", "jsonPath":".status.starRocksBeStatus.phase"}"#,
    printcolumn = r#"{"name":"CN", "type":"string", "jsonPath":".status.starRocksCnStatus.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StarRocksClusterSpec {
    /// Front-end (metadata and query planning) nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_fe_spec: Option<ComponentSpec>,

    /// Back-end (storage and compute) nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_be_spec: Option<ComponentSpec>,

    /// Elastic compute nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_cn_spec: Option<ComponentSpec>,

    /// Optional nginx proxy in front of the FE http port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_fe_proxy_spec: Option<FeProxySpec>,

    /// Secret holding `username` and `password` used to deregister compute nodes.
    /// Defaults to `root` without a password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret: Option<String>,
}

/// Specification shared by the FE, BE and CN components
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Container image reference
    pub image: String,

    /// Desired replica count. `None` hands ownership of the count to an external scaler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// ConfigMap holding the component configuration file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_info: Option<ConfigMapInfo>,

    /// Volumes mounted into every pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage_volumes: Vec<StorageVolume>,

    /// External service exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ExposeSpec>,

    /// Compute resources for the main container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra labels added to pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_labels: BTreeMap<String, String>,

    /// Extra annotations added to pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    /// Extra environment variables for the main container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Service account used by the pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Horizontal autoscaling policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_scaling_policy: Option<AutoScalingPolicy>,

    /// Periodic jobs run alongside the component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduled_jobs: Vec<ScheduledJobSpec>,
}

impl ComponentSpec {
    /// Whether the replica count is owned by something other than this operator
    pub fn replicas_ceded(&self) -> bool {
        self.replicas.is_none() || self.auto_scaling_policy.is_some()
    }
}

/// Reference to a key of a ConfigMap
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapInfo {
    pub config_map_name: String,
    pub resolve_key: String,
}

/// A volume mounted into component pods
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolume {
    /// Logical volume name, also the claim template name
    pub name: String,

    /// Storage class; `emptyDir` and `hostPath` select ephemeral storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested size (e.g. "10Gi"). Sizes starting with "0" are ephemeral.
    pub storage_size: String,

    /// Mount path inside the container
    pub mount_path: String,

    /// Host directory for `hostPath` volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
}

/// Storage class name selecting an emptyDir volume
pub const EMPTY_DIR_STORAGE: &str = "emptyDir";
/// Storage class name selecting a hostPath volume
pub const HOST_PATH_STORAGE: &str = "hostPath";

impl StorageVolume {
    /// Whether the volume is backed by node-local ephemeral storage instead of a claim
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self.storage_class_name.as_deref(),
            Some(EMPTY_DIR_STORAGE) | Some(HOST_PATH_STORAGE)
        ) || self.storage_size.starts_with('0')
    }
}

/// Service exposure settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposeSpec {
    #[serde(default, rename = "type")]
    pub type_: ServiceType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    /// Fixed node ports keyed by container port number
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ExposePort>,
}

/// Node port pinned for a given container port
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExposePort {
    pub container_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Kubernetes service type
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::LoadBalancer => write!(f, "LoadBalancer"),
        }
    }
}

/// Resource requirements for component pods
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Horizontal autoscaling policy
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalingPolicy {
    /// Autoscaling API generation to target
    #[serde(default)]
    pub version: AutoscalingVersion,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    pub max_replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<ScalingMetric>,
}

/// Autoscaling API generation
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum AutoscalingVersion {
    #[serde(rename = "v1")]
    V1,
    #[default]
    #[serde(rename = "v2", alias = "v2beta2")]
    V2,
}

/// Resource utilization target
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScalingMetric {
    pub resource: ScalingResource,
    pub target_average_utilization: i32,
}

/// Resource a scaling metric observes
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScalingResource {
    Cpu,
    Memory,
}

impl std::fmt::Display for ScalingResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingResource::Cpu => write!(f, "cpu"),
            ScalingResource::Memory => write!(f, "memory"),
        }
    }
}

/// A periodic job scheduled next to a component
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledJobSpec {
    /// Job name, unique within the component
    pub name: String,

    /// Cron schedule
    pub schedule: String,

    /// Image override; defaults to the component image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// nginx proxy placed in front of the FE
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeProxySpec {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ExposeSpec>,

    /// DNS resolver used by nginx; defaults to kube-dns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Status of the StarRocksCluster
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StarRocksClusterStatus {
    /// Aggregated cluster phase
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_fe_status: Option<ComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_be_status: Option<ComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_cn_status: Option<ComponentStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_rocks_fe_proxy_status: Option<ComponentStatus>,
}

impl StarRocksClusterStatus {
    /// Status of a component by its short name (`fe`, `be`, `cn`, `fe-proxy`)
    pub fn component(&self, name: &str) -> Option<&ComponentStatus> {
        match name {
            "fe" => self.star_rocks_fe_status.as_ref(),
            "be" => self.star_rocks_be_status.as_ref(),
            "cn" => self.star_rocks_cn_status.as_ref(),
            "fe-proxy" => self.star_rocks_fe_proxy_status.as_ref(),
            _ => None,
        }
    }

    /// Statuses of all components currently present
    pub fn components(&self) -> impl Iterator<Item = &ComponentStatus> {
        [
            self.star_rocks_fe_status.as_ref(),
            self.star_rocks_be_status.as_ref(),
            self.star_rocks_cn_status.as_ref(),
            self.star_rocks_fe_proxy_status.as_ref(),
        ]
        .into_iter()
        .flatten()
    }

    /// Body of a JSON merge patch that turns any persisted status into this
    /// one.
    ///
    /// A merge patch only removes keys it sets to `null`, so every field
    /// skipped by serialization is sent as an explicit `null`.
    pub fn to_merge_patch(&self) -> serde_json::Result<serde_json::Value> {
        let mut value = serde_json::to_value(self)?;
        null_missing(&mut value, STATUS_FIELDS);
        for slot in COMPONENT_STATUS_SLOTS {
            if let Some(component) = value.get_mut(*slot) {
                null_missing(component, COMPONENT_STATUS_FIELDS);
            }
        }
        Ok(value)
    }
}

/// Serialized field names of [`StarRocksClusterStatus`]
const STATUS_FIELDS: &[&str] = &[
    "phase",
    "reason",
    "observedGeneration",
    "conditions",
    "starRocksFeStatus",
    "starRocksBeStatus",
    "starRocksCnStatus",
    "starRocksFeProxyStatus",
];

const COMPONENT_STATUS_SLOTS: &[&str] = &[
    "starRocksFeStatus",
    "starRocksBeStatus",
    "starRocksCnStatus",
    "starRocksFeProxyStatus",
];

/// Serialized field names of [`ComponentStatus`]
const COMPONENT_STATUS_FIELDS: &[&str] = &[
    "phase",
    "reason",
    "resourceNames",
    "serviceName",
    "horizontalScaler",
    "runningInstances",
    "creatingInstances",
    "failedInstances",
];

fn null_missing(value: &mut serde_json::Value, fields: &[&str]) {
    if let Some(map) = value.as_object_mut() {
        for field in fields {
            map.entry(*field).or_insert(serde_json::Value::Null);
        }
    }
}

/// Observed state of one component
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default)]
    pub phase: ComponentPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Names of the workload and services owned by the component
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,

    /// External service name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Autoscaler name, if one is deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scaler: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running_instances: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creating_instances: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_instances: Vec<String>,
}

/// Component lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ComponentPhase {
    /// No workload exists yet
    #[default]
    Waiting,
    /// Workload exists but not every replica is ready
    Reconciling,
    /// Every replica is ready
    Running,
    /// At least one pod failed
    Failed,
}

impl std::fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComponentPhase::Waiting => write!(f, "Waiting"),
            ComponentPhase::Reconciling => write!(f, "Reconciling"),
            ComponentPhase::Running => write!(f, "Running"),
            ComponentPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Cluster lifecycle phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// At least one component is still converging
    #[default]
    Pending,
    /// Every component is running
    Running,
    /// At least one component failed
    Failed,
    /// The cluster is being deleted
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Failed => write!(f, "Failed"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
