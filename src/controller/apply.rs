//! Content-hash diff and apply engine
//!
//! Desired objects are stamped with a hash of their semantically relevant
//! fields. On the next pass the stored hashes are compared, and an unchanged
//! object costs one read and no write.
//!
//! Hashes are computed over fixed-shape projection structs. Maps inside them
//! are `BTreeMap`s and claim templates are sorted by name, so the digest does
//! not depend on insertion order.

use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PodTemplateSpec, Service};
use kube::ResourceExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::client::{KubeClient, NamespacedObject};
use crate::controller::error::Result;
use crate::controller::wait::retry_write;
use crate::resources::deterministic_hash;
use crate::resources::statefulset::EXTERNALLY_SCALED_ANNOTATION;

/// Annotation holding the content hash of the last applied desired state
pub const HASH_ANNOTATION: &str = "starrocks.com/content-hash";

/// Pod template annotation whose change rolls every pod
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Workload annotation tracking a requested rolling restart
pub const RESTART_STATE_ANNOTATION: &str = "starrocks.com/restart-state";

/// Restart in progress
pub const RESTART_STATE_RESTARTING: &str = "restarting";

/// Restart rolled out
pub const RESTART_STATE_FINISHED: &str = "finished";

/// Workload annotations written by the operator itself
const OWNED_ANNOTATIONS: &[&str] = &[
    HASH_ANNOTATION,
    EXTERNALLY_SCALED_ANNOTATION,
    RESTART_STATE_ANNOTATION,
];

/// What an apply did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Per-kind rules of the apply engine
pub trait ApplyStrategy<K: NamespacedObject>: Send + Sync {
    /// Carry values owned by someone else from the live object into the
    /// desired one before hashing
    fn prepare(&self, _desired: &mut K, _live: Option<&K>) {}

    /// Hash of the semantically relevant projection
    fn hash(&self, object: &K) -> Result<String>;

    /// Whether `live` already matches the stamped `desired`
    fn equal(&self, desired: &K, live: &K) -> Result<bool> {
        let desired_hash = stored_hash(desired);
        match stored_hash(live) {
            Some(live_hash) => Ok(desired_hash == Some(live_hash)),
            None => Ok(desired_hash == Some(self.hash(live)?.as_str())),
        }
    }

    /// Copy server-assigned and immutable fields from `live` into `desired`
    fn merge(&self, desired: &mut K, live: &K) {
        desired.meta_mut().resource_version = live.meta().resource_version.clone();
        carry_foreign_annotations(desired, live);
    }
}

/// The hash stored on an object, if any
pub fn stored_hash<K: NamespacedObject>(object: &K) -> Option<&str> {
    object.annotations().get(HASH_ANNOTATION).map(String::as_str)
}

fn stamp<K: NamespacedObject>(object: &mut K, hash: String) {
    object
        .annotations_mut()
        .insert(HASH_ANNOTATION.to_string(), hash);
}

fn hash_of<T: Serialize>(projection: &T) -> Result<String> {
    Ok(deterministic_hash(&serde_json::to_vec(projection)?))
}

/// Keep live annotations added by the platform or by users
fn carry_foreign_annotations<K: NamespacedObject>(desired: &mut K, live: &K) {
    let foreign: Vec<(String, String)> = live
        .annotations()
        .iter()
        .filter(|(k, _)| !OWNED_ANNOTATIONS.contains(&k.as_str()))
        .filter(|(k, _)| !desired.annotations().contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    desired.annotations_mut().extend(foreign);
}

/// Annotations relevant for hashing, without the hash itself
fn hashed_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    annotations
        .iter()
        .filter(|(k, _)| k.as_str() != HASH_ANNOTATION)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// Create-or-replace `desired` using `strategy`.
///
/// Conflicts, create races and delete races are retried with fresh state a
/// bounded number of times.
pub async fn apply<C, K, S>(
    client: &C,
    cancel: &CancellationToken,
    namespace: &str,
    desired: &K,
    strategy: &S,
) -> Result<ApplyOutcome>
where
    C: KubeClient,
    K: NamespacedObject,
    S: ApplyStrategy<K>,
{
    let what = format!("apply {} {}", K::kind(&()), desired.name_any());
    retry_write(cancel, &what, || apply_once(client, namespace, desired, strategy)).await
}

async fn apply_once<C, K, S>(
    client: &C,
    namespace: &str,
    desired: &K,
    strategy: &S,
) -> Result<ApplyOutcome>
where
    C: KubeClient,
    K: NamespacedObject,
    S: ApplyStrategy<K>,
{
    let name = desired.name_any();
    let live: Option<K> = client.get(namespace, &name).await?;

    let mut desired = desired.clone();
    strategy.prepare(&mut desired, live.as_ref());
    let hash = strategy.hash(&desired)?;
    stamp(&mut desired, hash);

    let Some(live) = live else {
        client.create(namespace, &desired).await?;
        info!(kind = K::kind(&()).as_ref(), name = %name, "Created resource");
        return Ok(ApplyOutcome::Created);
    };

    if strategy.equal(&desired, &live)? {
        return Ok(ApplyOutcome::Unchanged);
    }

    strategy.merge(&mut desired, &live);
    client.replace(namespace, &desired).await?;
    info!(kind = K::kind(&()).as_ref(), name = %name, "Updated resource");
    Ok(ApplyOutcome::Updated)
}

/// Hashes whole objects minus status and server-managed metadata
#[derive(Clone, Copy, Debug, Default)]
pub struct ObjectStrategy;

impl<K: NamespacedObject> ApplyStrategy<K> for ObjectStrategy {
    fn hash(&self, object: &K) -> Result<String> {
        let mut body = serde_json::to_value(object)?;
        if let Some(map) = body.as_object_mut() {
            map.remove("metadata");
            map.remove("status");
        }
        let projection = ObjectProjection {
            name: object.meta().name.as_deref(),
            namespace: object.meta().namespace.as_deref(),
            labels: object.meta().labels.as_ref(),
            annotations: hashed_annotations(object.annotations()),
            body,
        };
        hash_of(&projection)
    }
}

#[derive(Serialize)]
struct ObjectProjection<'a> {
    name: Option<&'a str>,
    namespace: Option<&'a str>,
    labels: Option<&'a BTreeMap<String, String>>,
    annotations: BTreeMap<&'a str, &'a str>,
    body: serde_json::Value,
}

/// Services keep their allocated addresses and node ports
#[derive(Clone, Copy, Debug, Default)]
pub struct ServiceStrategy;

#[derive(Serialize)]
struct ServiceProjection<'a> {
    name: Option<&'a str>,
    namespace: Option<&'a str>,
    labels: Option<&'a BTreeMap<String, String>>,
    annotations: BTreeMap<&'a str, &'a str>,
    spec: Option<&'a k8s_openapi::api::core::v1::ServiceSpec>,
}

impl ApplyStrategy<Service> for ServiceStrategy {
    fn hash(&self, svc: &Service) -> Result<String> {
        hash_of(&ServiceProjection {
            name: svc.metadata.name.as_deref(),
            namespace: svc.metadata.namespace.as_deref(),
            labels: svc.metadata.labels.as_ref(),
            annotations: hashed_annotations(svc.annotations()),
            spec: svc.spec.as_ref(),
        })
    }

    fn merge(&self, desired: &mut Service, live: &Service) {
        desired.metadata.resource_version = live.metadata.resource_version.clone();
        carry_foreign_annotations(desired, live);

        let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) else {
            return;
        };
        spec.cluster_ip = live_spec.cluster_ip.clone();
        spec.cluster_ips = live_spec.cluster_ips.clone();
        spec.ip_families = live_spec.ip_families.clone();
        spec.ip_family_policy = live_spec.ip_family_policy.clone();
        if spec.health_check_node_port.is_none() {
            spec.health_check_node_port = live_spec.health_check_node_port;
        }

        // Keep allocated node ports unless the spec pins one
        let live_ports = live_spec.ports.as_deref().unwrap_or_default();
        for port in spec.ports.iter_mut().flatten() {
            if port.node_port.is_none() {
                port.node_port = live_ports
                    .iter()
                    .find(|p| p.name == port.name)
                    .and_then(|p| p.node_port);
            }
        }
    }
}

/// StatefulSets cede replicas to external scalers and survive restarts
#[derive(Clone, Copy, Debug, Default)]
pub struct StatefulSetStrategy {
    /// The cluster resource currently requests a rolling restart
    pub restart_requested: bool,
}

#[derive(Serialize)]
struct StatefulSetProjection<'a> {
    name: Option<&'a str>,
    namespace: Option<&'a str>,
    labels: Option<&'a BTreeMap<String, String>>,
    template: Option<&'a PodTemplateSpec>,
    service_name: Option<&'a str>,
    volume_claim_templates: Vec<&'a PersistentVolumeClaim>,
    replicas: Option<i32>,
}

/// Hash of a StatefulSet projection, optionally ignoring the replica count
pub fn statefulset_hash(sts: &StatefulSet, exclude_replicas: bool) -> Result<String> {
    let spec = sts.spec.as_ref();
    let mut claims: Vec<&PersistentVolumeClaim> = spec
        .and_then(|s| s.volume_claim_templates.as_ref())
        .map(|c| c.iter().collect())
        .unwrap_or_default();
    claims.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

    hash_of(&StatefulSetProjection {
        name: sts.metadata.name.as_deref(),
        namespace: sts.metadata.namespace.as_deref(),
        labels: sts.metadata.labels.as_ref(),
        template: spec.map(|s| &s.template),
        service_name: spec.and_then(|s| s.service_name.as_deref()),
        volume_claim_templates: claims,
        replicas: if exclude_replicas {
            None
        } else {
            spec.and_then(|s| s.replicas)
        },
    })
}

/// Whether a workload's replica count belongs to an external scaler
pub fn is_externally_scaled<K: NamespacedObject>(workload: &K) -> bool {
    workload
        .annotations()
        .get(EXTERNALLY_SCALED_ANNOTATION)
        .is_some_and(|v| v == "true")
}

fn template_annotations_mut(sts: &mut StatefulSet) -> &mut BTreeMap<String, String> {
    let spec = sts.spec.get_or_insert_with(Default::default);
    spec.template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
}

fn template_annotation<'a>(sts: &'a StatefulSet, key: &str) -> Option<&'a String> {
    sts.spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(key)
}

/// Restart state recorded on a workload
pub fn restart_state(sts: &StatefulSet) -> Option<&str> {
    sts.annotations()
        .get(RESTART_STATE_ANNOTATION)
        .map(String::as_str)
}

impl ApplyStrategy<StatefulSet> for StatefulSetStrategy {
    fn prepare(&self, desired: &mut StatefulSet, live: Option<&StatefulSet>) {
        let live_state = live.and_then(restart_state);

        if self.restart_requested && live_state != Some(RESTART_STATE_RESTARTING) {
            template_annotations_mut(desired)
                .insert(RESTARTED_AT_ANNOTATION.to_string(), Utc::now().to_rfc3339());
            desired.annotations_mut().insert(
                RESTART_STATE_ANNOTATION.to_string(),
                RESTART_STATE_RESTARTING.to_string(),
            );
            return;
        }

        // Re-carry an earlier restart stamp so the rollout is not reverted
        let Some(live) = live else {
            return;
        };
        if let Some(stamp) = template_annotation(live, RESTARTED_AT_ANNOTATION) {
            template_annotations_mut(desired)
                .insert(RESTARTED_AT_ANNOTATION.to_string(), stamp.clone());
        }
        if let Some(state) = live_state {
            desired
                .annotations_mut()
                .insert(RESTART_STATE_ANNOTATION.to_string(), state.to_string());
        }
    }

    fn hash(&self, sts: &StatefulSet) -> Result<String> {
        statefulset_hash(sts, is_externally_scaled(sts))
    }

    fn equal(&self, desired: &StatefulSet, live: &StatefulSet) -> Result<bool> {
        if let Some(live_hash) = stored_hash(live) {
            return Ok(stored_hash(desired) == Some(live_hash));
        }
        let exclude = is_externally_scaled(live);
        Ok(statefulset_hash(desired, exclude)? == statefulset_hash(live, exclude)?)
    }

    fn merge(&self, desired: &mut StatefulSet, live: &StatefulSet) {
        desired.metadata.resource_version = live.metadata.resource_version.clone();
        carry_foreign_annotations(desired, live);

        // Omitted replicas would reset to the server default
        if let Some(spec) = desired.spec.as_mut()
            && spec.replicas.is_none()
        {
            spec.replicas = live.spec.as_ref().and_then(|s| s.replicas);
        }
    }
}

/// Deployments cede replicas to external scalers like StatefulSets
#[derive(Clone, Copy, Debug, Default)]
pub struct DeploymentStrategy;

impl ApplyStrategy<Deployment> for DeploymentStrategy {
    fn hash(&self, deployment: &Deployment) -> Result<String> {
        if !is_externally_scaled(deployment) {
            return <ObjectStrategy as ApplyStrategy<Deployment>>::hash(&ObjectStrategy, deployment);
        }
        let mut projected = deployment.clone();
        if let Some(spec) = projected.spec.as_mut() {
            spec.replicas = None;
        }
        <ObjectStrategy as ApplyStrategy<Deployment>>::hash(&ObjectStrategy, &projected)
    }

    fn merge(&self, desired: &mut Deployment, live: &Deployment) {
        desired.metadata.resource_version = live.metadata.resource_version.clone();
        carry_foreign_annotations(desired, live);

        if let Some(spec) = desired.spec.as_mut()
            && spec.replicas.is_none()
        {
            spec.replicas = live.spec.as_ref().and_then(|s| s.replicas);
        }
    }
}

/// Apply a StatefulSet
pub async fn apply_statefulset<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    namespace: &str,
    desired: &StatefulSet,
    restart_requested: bool,
) -> Result<ApplyOutcome> {
    apply(
        client,
        cancel,
        namespace,
        desired,
        &StatefulSetStrategy { restart_requested },
    )
    .await
}

/// Apply a Deployment
pub async fn apply_deployment<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    namespace: &str,
    desired: &Deployment,
) -> Result<ApplyOutcome> {
    apply(client, cancel, namespace, desired, &DeploymentStrategy).await
}

/// Stamp and create a StatefulSet that is known to be absent
pub async fn create_statefulset<C: KubeClient>(
    client: &C,
    namespace: &str,
    desired: &StatefulSet,
) -> Result<()> {
    let mut desired = desired.clone();
    let hash = StatefulSetStrategy::default().hash(&desired)?;
    stamp(&mut desired, hash);
    client.create(namespace, &desired).await?;
    info!(name = %desired.name_any(), "Created StatefulSet");
    Ok(())
}

/// Apply a Service
pub async fn apply_service<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    namespace: &str,
    desired: &Service,
) -> Result<ApplyOutcome> {
    apply(client, cancel, namespace, desired, &ServiceStrategy).await
}

/// Apply any other object
pub async fn apply_object<C: KubeClient, K: NamespacedObject>(
    client: &C,
    cancel: &CancellationToken,
    namespace: &str,
    desired: &K,
) -> Result<ApplyOutcome> {
    apply(client, cancel, namespace, desired, &ObjectStrategy).await
}
