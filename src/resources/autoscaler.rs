//! HorizontalPodAutoscaler generation
//!
//! The autoscaling API generation is chosen by the policy: `v1` only knows a
//! CPU utilization target, `v2` carries the full metric list.

use k8s_openapi::api::autoscaling::{v1 as autoscaling_v1, v2 as autoscaling_v2};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use std::collections::BTreeMap;

use crate::crd::{AutoScalingPolicy, AutoscalingVersion, ScalingResource, StarRocksCluster};
use crate::resources::common::owner_reference;

/// Autoscaler in the API generation requested by the policy
#[derive(Clone, Debug)]
pub enum Autoscaler {
    V1(autoscaling_v1::HorizontalPodAutoscaler),
    V2(autoscaling_v2::HorizontalPodAutoscaler),
}

/// Generate the autoscaler targeting a component StatefulSet
pub fn generate_autoscaler(
    cluster: &StarRocksCluster,
    name: &str,
    target: &str,
    labels: &BTreeMap<String, String>,
    policy: &AutoScalingPolicy,
) -> Autoscaler {
    let metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: cluster.namespace(),
        labels: Some(labels.clone()),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    };

    match policy.version {
        AutoscalingVersion::V1 => {
            let cpu_target = policy
                .metrics
                .iter()
                .find(|m| m.resource == ScalingResource::Cpu)
                .map(|m| m.target_average_utilization);

            Autoscaler::V1(autoscaling_v1::HorizontalPodAutoscaler {
                metadata,
                spec: Some(autoscaling_v1::HorizontalPodAutoscalerSpec {
                    scale_target_ref: autoscaling_v1::CrossVersionObjectReference {
                        api_version: Some("apps/v1".to_string()),
                        kind: "StatefulSet".to_string(),
                        name: target.to_string(),
                    },
                    min_replicas: policy.min_replicas,
                    max_replicas: policy.max_replicas,
                    target_cpu_utilization_percentage: cpu_target,
                }),
                ..Default::default()
            })
        }
        AutoscalingVersion::V2 => {
            let metrics: Vec<_> = policy
                .metrics
                .iter()
                .map(|m| autoscaling_v2::MetricSpec {
                    type_: "Resource".to_string(),
                    resource: Some(autoscaling_v2::ResourceMetricSource {
                        name: m.resource.to_string(),
                        target: autoscaling_v2::MetricTarget {
                            type_: "Utilization".to_string(),
                            average_utilization: Some(m.target_average_utilization),
                            ..Default::default()
                        },
                    }),
                    ..Default::default()
                })
                .collect();

            Autoscaler::V2(autoscaling_v2::HorizontalPodAutoscaler {
                metadata,
                spec: Some(autoscaling_v2::HorizontalPodAutoscalerSpec {
                    scale_target_ref: autoscaling_v2::CrossVersionObjectReference {
                        api_version: Some("apps/v1".to_string()),
                        kind: "StatefulSet".to_string(),
                        name: target.to_string(),
                    },
                    min_replicas: policy.min_replicas,
                    max_replicas: policy.max_replicas,
                    metrics: if metrics.is_empty() {
                        None
                    } else {
                        Some(metrics)
                    },
                    ..Default::default()
                }),
                ..Default::default()
            })
        }
    }
}
