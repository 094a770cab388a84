//! StatefulSet generation for FE, BE and CN

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::StorageVolume;
use crate::resources::common::{non_empty, owner_reference};
use crate::resources::pod::{ComponentParams, generate_pod_template};

/// Marker on workloads whose replica count is owned by an external scaler
pub const EXTERNALLY_SCALED_ANNOTATION: &str = "starrocks.com/externally-scaled";

/// Generate the StatefulSet of a component.
///
/// When the replica count is ceded (null in the spec or an autoscaler is
/// requested) the replica field is omitted and the workload is marked as
/// externally scaled.
pub fn generate_statefulset(params: &ComponentParams) -> StatefulSet {
    let ceded = params.spec.replicas_ceded();
    let replicas = if ceded { None } else { params.spec.replicas };

    let mut annotations = BTreeMap::new();
    if ceded {
        annotations.insert(EXTERNALLY_SCALED_ANNOTATION.to_string(), "true".to_string());
    }

    let claims = volume_claim_templates(&params.spec.storage_volumes);

    // FE members join the quorum one at a time
    let pod_management_policy = if params.component() == "fe" {
        "OrderedReady"
    } else {
        "Parallel"
    };

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(params.workload_name.clone()),
            namespace: params.cluster.namespace(),
            labels: Some(params.labels.clone()),
            annotations: non_empty(annotations),
            owner_references: Some(vec![owner_reference(params.cluster)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas,
            selector: LabelSelector {
                match_labels: Some(params.labels.clone()),
                ..Default::default()
            },
            service_name: Some(params.search_service.clone()),
            template: generate_pod_template(params),
            volume_claim_templates: if claims.is_empty() {
                None
            } else {
                Some(claims)
            },
            pod_management_policy: Some(pod_management_policy.to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            persistent_volume_claim_retention_policy: Some(
                StatefulSetPersistentVolumeClaimRetentionPolicy {
                    when_deleted: Some("Retain".to_string()),
                    when_scaled: Some("Retain".to_string()),
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim templates for every volume not backed by ephemeral storage
pub fn volume_claim_templates(volumes: &[StorageVolume]) -> Vec<PersistentVolumeClaim> {
    volumes
        .iter()
        .filter(|v| !v.is_ephemeral())
        .map(|v| PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(v.name.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: v.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(v.storage_size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

/// Requested storage of a claim template
pub fn claim_storage_request(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.as_str())
}

/// Replace the storage request of a claim template
pub fn set_claim_storage_request(claim: &mut PersistentVolumeClaim, size: &str) {
    let spec = claim.spec.get_or_insert_with(Default::default);
    let resources = spec.resources.get_or_insert_with(Default::default);
    resources
        .requests
        .get_or_insert_with(Default::default)
        .insert("storage".to_string(), Quantity(size.to_string()));
}
