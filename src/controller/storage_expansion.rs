//! Storage expansion for component StatefulSets
//!
//! StatefulSet claim templates are immutable, so a changed volume size is
//! carried out by resizing the existing claims and recreating the workload
//! around them. Whether the claims can be resized while mounted depends on the
//! storage backend; when in doubt the workload is taken down first.
//!
//! Shrinking is never performed. Rejected changes keep the live size in the
//! desired template and are reported back so the rest of the workload still
//! converges.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::apply::{
    ApplyStrategy, StatefulSetStrategy, apply_statefulset, create_statefulset,
};
use crate::controller::client::{KubeClient, Propagation};
use crate::controller::error::{Error, Result};
use crate::controller::wait::{PollConfig, poll_until};
use crate::crd::{EMPTY_DIR_STORAGE, HOST_PATH_STORAGE};
use crate::resources::statefulset::{claim_storage_request, set_claim_storage_request};
use tokio_util::sync::CancellationToken;

/// StorageClass parameter overriding the detachment classification
pub const EXPANSION_MODE_PARAMETER: &str = "expansion-mode";

/// Provisioners known to resize attached volumes safely
const ONLINE_EXPANSION_PROVISIONERS: &[&str] = &[
    "ebs.csi.aws.com",
    "pd.csi.storage.gke.io",
    "disk.csi.azure.com",
    "diskplugin.csi.alibabacloud.com",
    "kubernetes.io/aws-ebs",
    "kubernetes.io/gce-pd",
    "kubernetes.io/azure-disk",
];

/// Wait budgets of the expansion sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpansionConfig {
    /// Waiting for a deleted StatefulSet to disappear
    pub workload_deletion: PollConfig,
    /// Waiting for pods to release the claims
    pub detach: PollConfig,
    /// Waiting for claims to report the new size
    pub resize: PollConfig,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            workload_deletion: PollConfig::new(Duration::from_secs(2), 60),
            detach: PollConfig::new(Duration::from_secs(5), 60),
            resize: PollConfig::new(Duration::from_secs(10), 60),
        }
    }
}

/// One claim to resize
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PvcExpansion {
    pub name: String,
    pub namespace: String,
    /// Claim template the claim was created from
    pub volume: String,
    pub current_size: String,
    pub target_size: String,
}

/// Result of comparing live and desired claim templates
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpansionPlan {
    pub pvcs: Vec<PvcExpansion>,
    /// At least one claim cannot be resized while mounted
    pub requires_detachment: bool,
    /// Expansion is needed and nothing but sizes changed
    pub only_size_changed: bool,
    /// Non-size template changes that need the workload recreated
    pub needs_recreation: bool,
    /// Refused changes
    pub errors: Vec<String>,
    /// Template sizes to keep at their live value, by template name
    pub pinned: BTreeMap<String, String>,
}

impl ExpansionPlan {
    pub fn needs_expansion(&self) -> bool {
        !self.pvcs.is_empty()
    }

    /// Rewrite desired claim templates so refused changes are not applied
    pub fn pin_sizes(&self, desired: &mut StatefulSet) {
        let Some(claims) = desired
            .spec
            .as_mut()
            .and_then(|s| s.volume_claim_templates.as_mut())
        else {
            return;
        };
        for claim in claims {
            if let Some(size) = claim
                .metadata
                .name
                .as_ref()
                .and_then(|name| self.pinned.get(name))
            {
                set_claim_storage_request(claim, size);
            }
        }
    }
}

/// Parse a Kubernetes quantity into bytes
pub fn parse_quantity(value: &str) -> Option<u128> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 0.001,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        _ => return None,
    };
    Some((number * multiplier).round() as u128)
}

/// Whether resizing claims of `sc` requires detaching them first.
///
/// Node-local storage has nothing to detach. An `expansion-mode` parameter
/// decides when present; otherwise only provisioners on the online allow-list
/// are trusted. Unknown provisioners require detachment.
pub fn requires_detachment(sc: &StorageClass) -> bool {
    let name = sc.name_any();
    let provisioner = sc.provisioner.to_ascii_lowercase();
    if name == EMPTY_DIR_STORAGE
        || name == HOST_PATH_STORAGE
        || provisioner.contains("hostpath")
        || provisioner == "rancher.io/local-path"
    {
        return false;
    }

    if let Some(mode) = sc
        .parameters
        .as_ref()
        .and_then(|p| p.get(EXPANSION_MODE_PARAMETER))
    {
        return match mode.to_ascii_lowercase().as_str() {
            "online" => false,
            "offline" | "detached" => true,
            other => {
                warn!(storage_class = %name, mode = other, "Unknown expansion mode, assuming detachment");
                true
            }
        };
    }

    !ONLINE_EXPANSION_PROVISIONERS.contains(&sc.provisioner.as_str())
}

fn claim_templates(sts: &StatefulSet) -> BTreeMap<String, &PersistentVolumeClaim> {
    sts.spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|c| c.metadata.name.clone().map(|n| (n, c)))
        .collect()
}

/// Claim template fields other than the storage request
fn non_size_differs(current: &PersistentVolumeClaim, desired: &PersistentVolumeClaim) -> bool {
    let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_ref()) else {
        return current.spec.is_some() != desired.spec.is_some();
    };

    // An unset class means "default" and is defaulted by the server
    if desired.storage_class_name.is_some()
        && desired.storage_class_name != current.storage_class_name
    {
        return true;
    }
    if desired.access_modes != current.access_modes {
        return true;
    }

    let strip = |r: Option<&k8s_openapi::api::core::v1::VolumeResourceRequirements>| {
        let mut requests = r.and_then(|r| r.requests.clone()).unwrap_or_default();
        requests.remove("storage");
        let limits = r.and_then(|r| r.limits.clone()).unwrap_or_default();
        (requests, limits)
    };
    strip(current.resources.as_ref()) != strip(desired.resources.as_ref())
}

/// Ordinal of a claim created from template `volume` of StatefulSet `sts`
fn claim_ordinal(claim_name: &str, volume: &str, sts: &str) -> Option<u32> {
    claim_name
        .strip_prefix(volume)?
        .strip_prefix('-')?
        .strip_prefix(sts)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

/// Compare live and desired claim templates and plan the expansion
pub async fn detect_expansion<C: KubeClient>(
    client: &C,
    live: &StatefulSet,
    desired_claims: &[PersistentVolumeClaim],
) -> Result<ExpansionPlan> {
    let namespace = live.namespace().unwrap_or_default();
    let sts_name = live.name_any();
    let current = claim_templates(live);
    let desired: BTreeMap<String, &PersistentVolumeClaim> = desired_claims
        .iter()
        .filter_map(|c| c.metadata.name.clone().map(|n| (n, c)))
        .collect();

    let mut plan = ExpansionPlan::default();
    let mut live_claims: Option<Vec<PersistentVolumeClaim>> = None;

    if current.keys().ne(desired.keys()) {
        plan.needs_recreation = true;
    }

    for (volume, desired_claim) in &desired {
        let Some(current_claim) = current.get(volume) else {
            continue;
        };
        if non_size_differs(current_claim, desired_claim) {
            plan.needs_recreation = true;
        }

        let (Some(current_size), Some(target_size)) = (
            claim_storage_request(current_claim),
            claim_storage_request(desired_claim),
        ) else {
            continue;
        };
        let (Some(current_bytes), Some(target_bytes)) =
            (parse_quantity(current_size), parse_quantity(target_size))
        else {
            plan.errors.push(format!(
                "volume {}: cannot compare sizes {} and {}",
                volume, current_size, target_size
            ));
            plan.pinned.insert(volume.clone(), current_size.to_string());
            continue;
        };

        if target_bytes < current_bytes {
            plan.errors.push(format!(
                "volume {}: shrinking from {} to {} is not supported",
                volume, current_size, target_size
            ));
            plan.pinned.insert(volume.clone(), current_size.to_string());
            continue;
        }
        if target_bytes == current_bytes {
            continue;
        }

        let class_name = desired_claim
            .spec
            .as_ref()
            .and_then(|s| s.storage_class_name.clone())
            .or_else(|| {
                current_claim
                    .spec
                    .as_ref()
                    .and_then(|s| s.storage_class_name.clone())
            });
        let storage_class = match &class_name {
            Some(name) => client.get_storage_class(name).await?,
            None => client.default_storage_class().await?,
        };
        let Some(storage_class) = storage_class else {
            plan.errors.push(format!(
                "volume {}: storage class {} not found",
                volume,
                class_name.as_deref().unwrap_or("(default)")
            ));
            plan.pinned.insert(volume.clone(), current_size.to_string());
            continue;
        };
        if storage_class.allow_volume_expansion != Some(true) {
            plan.errors.push(format!(
                "volume {}: storage class {} does not allow volume expansion",
                volume,
                storage_class.name_any()
            ));
            plan.pinned.insert(volume.clone(), current_size.to_string());
            continue;
        }

        plan.requires_detachment |= requires_detachment(&storage_class);

        if live_claims.is_none() {
            live_claims = Some(client.list(&namespace, "").await?);
        }
        let mut owned: Vec<(u32, &PersistentVolumeClaim)> = live_claims
            .iter()
            .flatten()
            .filter_map(|pvc| claim_ordinal(&pvc.name_any(), volume, &sts_name).map(|o| (o, pvc)))
            .collect();
        owned.sort_by_key(|(ordinal, _)| *ordinal);

        for (_, pvc) in owned {
            plan.pvcs.push(PvcExpansion {
                name: pvc.name_any(),
                namespace: namespace.clone(),
                volume: volume.clone(),
                current_size: claim_storage_request(pvc)
                    .unwrap_or(current_size)
                    .to_string(),
                target_size: target_size.to_string(),
            });
        }
    }

    plan.only_size_changed = plan.needs_expansion() && !plan.needs_recreation;
    debug!(
        statefulset = %sts_name,
        pvcs = plan.pvcs.len(),
        requires_detachment = plan.requires_detachment,
        needs_recreation = plan.needs_recreation,
        errors = plan.errors.len(),
        "Detected storage changes"
    );
    Ok(plan)
}

/// Raise the storage request of every planned claim in place
pub async fn expand_pvcs<C: KubeClient>(client: &C, plan: &ExpansionPlan) -> Result<()> {
    for entry in &plan.pvcs {
        let Some(mut pvc) = client
            .get::<PersistentVolumeClaim>(&entry.namespace, &entry.name)
            .await?
        else {
            return Err(Error::NotFound(format!(
                "PersistentVolumeClaim {}/{}",
                entry.namespace, entry.name
            )));
        };
        if claim_storage_request(&pvc) == Some(entry.target_size.as_str()) {
            continue;
        }
        set_claim_storage_request(&mut pvc, &entry.target_size);
        client.replace(&entry.namespace, &pvc).await?;
        info!(
            pvc = %entry.name,
            from = %entry.current_size,
            to = %entry.target_size,
            "Requested volume expansion"
        );
    }
    Ok(())
}

/// Whether a claim has finished resizing to at least `target`
pub fn resize_complete(pvc: &PersistentVolumeClaim, target: &str) -> bool {
    let Some(status) = pvc.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Bound") {
        return false;
    }
    let conditions = status.conditions.as_deref().unwrap_or_default();
    let active = |kind: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == kind && c.status == "True")
    };
    if active("Resizing") {
        return false;
    }
    // The filesystem grows when the claim is next mounted
    if active("FileSystemResizePending") {
        return true;
    }

    let capacity = status
        .capacity
        .as_ref()
        .and_then(|c| c.get("storage"))
        .and_then(|q| parse_quantity(&q.0));
    matches!((capacity, parse_quantity(target)), (Some(have), Some(want)) if have >= want)
}

fn pod_uses_claims(pod: &Pod, claims: &[&str]) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    if matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    ) {
        return false;
    }
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .any(|source| claims.contains(&source.claim_name.as_str()))
}

async fn wait_for_workload_deletion<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    config: PollConfig,
    namespace: &str,
    name: &str,
) -> Result<()> {
    poll_until(cancel, config, &format!("StatefulSet {} deletion", name), || async {
        Ok(client.get::<StatefulSet>(namespace, name).await?.is_none())
    })
    .await
}

/// Take the workload down, resize its claims and bring it back.
///
/// Every wait fails closed: a timeout aborts the sequence before the next
/// step. Claims are retained when the StatefulSet is deleted, so an aborted
/// sequence is resumed by the next pass.
pub async fn expand_with_detachment<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    config: &ExpansionConfig,
    live: &StatefulSet,
    desired: &StatefulSet,
    plan: &ExpansionPlan,
) -> Result<()> {
    let namespace = live.namespace().unwrap_or_default();
    let name = live.name_any();
    let replicas = live.spec.as_ref().and_then(|s| s.replicas);

    info!(statefulset = %name, pvcs = plan.pvcs.len(), "Deleting workload to detach volumes for expansion");
    client
        .delete::<StatefulSet>(&namespace, &name, Propagation::Background)
        .await?;
    wait_for_workload_deletion(client, cancel, config.workload_deletion, &namespace, &name).await?;

    let claims: Vec<&str> = plan.pvcs.iter().map(|p| p.name.as_str()).collect();
    poll_until(cancel, config.detach, "volume detachment", || async {
        let pods: Vec<Pod> = client.list(&namespace, "").await?;
        Ok(!pods.iter().any(|pod| pod_uses_claims(pod, &claims)))
    })
    .await?;

    expand_pvcs(client, plan).await?;

    for entry in &plan.pvcs {
        poll_until(
            cancel,
            config.resize,
            &format!("PersistentVolumeClaim {} resize", entry.name),
            || async {
                let pvc = client
                    .get::<PersistentVolumeClaim>(&entry.namespace, &entry.name)
                    .await?;
                Ok(pvc.is_some_and(|pvc| resize_complete(&pvc, &entry.target_size)))
            },
        )
        .await?;
    }

    let mut recreated = desired.clone();
    if let Some(spec) = recreated.spec.as_mut() {
        spec.replicas = replicas;
    }
    create_statefulset(client, &namespace, &recreated).await?;
    info!(statefulset = %name, ?replicas, "Recreated workload after volume expansion");
    Ok(())
}

/// Replace the workload without touching its pods
async fn recreate_orphaning_pods<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    config: &ExpansionConfig,
    live: &StatefulSet,
    desired: &StatefulSet,
) -> Result<()> {
    let namespace = live.namespace().unwrap_or_default();
    let name = live.name_any();

    client
        .delete::<StatefulSet>(&namespace, &name, Propagation::Orphan)
        .await?;
    wait_for_workload_deletion(client, cancel, config.workload_deletion, &namespace, &name).await?;

    let mut recreated = desired.clone();
    if let Some(spec) = recreated.spec.as_mut()
        && spec.replicas.is_none()
    {
        spec.replicas = live.spec.as_ref().and_then(|s| s.replicas);
    }
    create_statefulset(client, &namespace, &recreated).await?;
    info!(statefulset = %name, "Recreated workload with new claim templates");
    Ok(())
}

/// Raise retained claims that are smaller than their template.
///
/// Runs before a missing workload is created. Claims outlive the
/// StatefulSet, so an expansion interrupted after the workload was deleted
/// is finished here instead of being lost.
async fn resume_expansion<C: KubeClient>(client: &C, desired: &StatefulSet) -> Result<()> {
    let templates = claim_templates(desired);
    if templates.is_empty() {
        return Ok(());
    }
    let namespace = desired.namespace().unwrap_or_default();
    let sts_name = desired.name_any();
    let claims: Vec<PersistentVolumeClaim> = client.list(&namespace, "").await?;

    let mut plan = ExpansionPlan::default();
    for (volume, template) in &templates {
        let Some(target) = claim_storage_request(template) else {
            continue;
        };
        let Some(target_bytes) = parse_quantity(target) else {
            continue;
        };

        for pvc in &claims {
            if claim_ordinal(&pvc.name_any(), volume, &sts_name).is_none() {
                continue;
            }
            let Some(current) = claim_storage_request(pvc) else {
                continue;
            };
            if !parse_quantity(current).is_some_and(|bytes| bytes < target_bytes) {
                continue;
            }

            let class_name = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone());
            let storage_class = match &class_name {
                Some(name) => client.get_storage_class(name).await?,
                None => client.default_storage_class().await?,
            };
            if storage_class.and_then(|sc| sc.allow_volume_expansion) != Some(true) {
                warn!(pvc = %pvc.name_any(), "Retained claim is smaller than its template but cannot be expanded");
                continue;
            }

            plan.pvcs.push(PvcExpansion {
                name: pvc.name_any(),
                namespace: namespace.clone(),
                volume: volume.clone(),
                current_size: current.to_string(),
                target_size: target.to_string(),
            });
        }
    }

    if plan.needs_expansion() {
        info!(statefulset = %sts_name, pvcs = plan.pvcs.len(), "Resuming interrupted volume expansion");
        expand_pvcs(client, &plan).await?;
    }
    Ok(())
}

/// Bring a component StatefulSet to its desired state, handling claim
/// template changes. Returns the refused volume changes.
pub async fn sync_statefulset<C: KubeClient>(
    client: &C,
    cancel: &CancellationToken,
    config: &ExpansionConfig,
    mut desired: StatefulSet,
    restart_requested: bool,
) -> Result<Vec<String>> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let Some(live) = client.get::<StatefulSet>(&namespace, &name).await? else {
        resume_expansion(client, &desired).await?;
        apply_statefulset(client, cancel, &namespace, &desired, restart_requested).await?;
        return Ok(Vec::new());
    };

    let desired_claims = desired
        .spec
        .as_ref()
        .and_then(|s| s.volume_claim_templates.clone())
        .unwrap_or_default();
    let plan = detect_expansion(client, &live, &desired_claims).await?;
    for error in &plan.errors {
        warn!(statefulset = %name, error = %error, "Refused volume change");
    }
    plan.pin_sizes(&mut desired);

    if !plan.needs_expansion() && !plan.needs_recreation {
        apply_statefulset(client, cancel, &namespace, &desired, restart_requested).await?;
        return Ok(plan.errors);
    }

    StatefulSetStrategy { restart_requested }.prepare(&mut desired, Some(&live));

    if plan.needs_expansion() && plan.requires_detachment {
        expand_with_detachment(client, cancel, config, &live, &desired, &plan).await?;
    } else {
        if plan.needs_expansion() {
            expand_pvcs(client, &plan).await?;
        }
        recreate_orphaning_pods(client, cancel, config, &live, &desired).await?;
    }
    Ok(plan.errors)
}
