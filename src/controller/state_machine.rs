//! Status aggregation for StarRocksCluster components
//!
//! Pod observations are reduced to a component phase, and component phases
//! to the cluster phase. Both steps are pure functions of the snapshot they
//! are given and hold no state between passes.
//!
//! ```text
//! Waiting ──► Reconciling ──► Running
//!    │             │             │
//!    └─────────────┴──► Failed ◄─┘
//! ```

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use crate::crd::{ClusterPhase, ComponentPhase, ComponentStatus};

/// Container waiting reasons that will not resolve on their own
const FAILED_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
];

/// Pods of a component split by state, each list sorted by pod name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodPartition {
    pub ready: Vec<String>,
    pub creating: Vec<String>,
    /// Failed pods with the reason they failed
    pub failed: Vec<(String, String)>,
}

impl PodPartition {
    pub fn failed_names(&self) -> Vec<String> {
        self.failed.iter().map(|(name, _)| name.clone()).collect()
    }
}

/// Why a pod is considered failed, if it is
pub fn failure_reason(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;

    match status.phase.as_deref() {
        Some("Failed") | Some("Unknown") | Some("Succeeded") => {
            return Some(
                status
                    .reason
                    .clone()
                    .or_else(|| status.message.clone())
                    .unwrap_or_else(|| format!("pod phase {}", status.phase.as_deref().unwrap_or_default())),
            );
        }
        _ => {}
    }

    status
        .container_statuses
        .iter()
        .flatten()
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
        .find(|reason| FAILED_WAITING_REASONS.contains(&reason.as_str()))
}

/// Whether every container of a running pod reports ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    match status.container_statuses.as_deref() {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|cs| cs.ready),
        _ => false,
    }
}

/// Partition pods into ready, creating and failed.
///
/// Terminating pods are still converging and count as creating.
pub fn classify_pods(pods: &[Pod]) -> PodPartition {
    let mut partition = PodPartition::default();

    for pod in pods {
        let name = pod.name_any();
        if pod.metadata.deletion_timestamp.is_some() {
            partition.creating.push(name);
        } else if let Some(reason) = failure_reason(pod) {
            partition.failed.push((name, reason));
        } else if is_pod_ready(pod) {
            partition.ready.push(name);
        } else {
            partition.creating.push(name);
        }
    }

    partition.ready.sort();
    partition.creating.sort();
    partition.failed.sort();
    partition
}

/// Derive a component phase from its pods and replica target.
///
/// `Running` exactly when the number of ready pods equals `replicas`.
/// Otherwise any failed pod makes the component `Failed`, with the first
/// failed pod's reason. Everything else is `Reconciling`; `Waiting` is left
/// to callers that have no workload yet.
pub fn derive_component_phase(
    partition: &PodPartition,
    replicas: i32,
) -> (ComponentPhase, Option<String>) {
    if partition.ready.len() as i64 == i64::from(replicas) {
        return (ComponentPhase::Running, None);
    }
    if let Some((pod, reason)) = partition.failed.first() {
        return (
            ComponentPhase::Failed,
            Some(format!("pod {} failed: {}", pod, reason)),
        );
    }
    let reason = format!(
        "{} of {} replicas ready, {} creating",
        partition.ready.len(),
        replicas,
        partition.creating.len()
    );
    (ComponentPhase::Reconciling, Some(reason))
}

/// Fill the instance lists and phase of a component status
pub fn apply_partition(status: &mut ComponentStatus, partition: PodPartition, replicas: i32) {
    let (phase, reason) = derive_component_phase(&partition, replicas);
    status.phase = phase;
    status.reason = reason;
    status.failed_instances = partition.failed_names();
    status.running_instances = partition.ready;
    status.creating_instances = partition.creating;
}

/// Derive the cluster phase from the present components.
///
/// Failed dominates pending; no components at all counts as running.
pub fn derive_cluster_phase<'a>(
    components: impl IntoIterator<Item = &'a ComponentStatus>,
) -> (ClusterPhase, Option<String>) {
    let mut pending = None;
    for status in components {
        match status.phase {
            ComponentPhase::Failed => {
                return (ClusterPhase::Failed, status.reason.clone());
            }
            ComponentPhase::Waiting | ComponentPhase::Reconciling => {
                if pending.is_none() {
                    pending = Some(status.reason.clone());
                }
            }
            ComponentPhase::Running => {}
        }
    }
    match pending {
        Some(reason) => (ClusterPhase::Pending, reason),
        None => (ClusterPhase::Running, None),
    }
}
