//! Service generation
//!
//! Every component gets two services: a headless `-search` service giving
//! pods stable DNS names (also the StatefulSet governing service) and a
//! client-facing `-service` whose type comes from the spec.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{ExposeSpec, StarRocksCluster};
use crate::resources::common::{non_empty, owner_reference};

fn service_ports(ports: &[(&str, i32)], expose: Option<&ExposeSpec>) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|(name, port)| ServicePort {
            name: Some(name.to_string()),
            port: *port,
            target_port: Some(IntOrString::Int(*port)),
            protocol: Some("TCP".to_string()),
            node_port: expose.and_then(|e| {
                e.ports
                    .iter()
                    .find(|p| p.container_port == *port)
                    .and_then(|p| p.node_port)
            }),
            ..Default::default()
        })
        .collect()
}

/// Generate the headless service used for pod DNS
pub fn generate_search_service(
    cluster: &StarRocksCluster,
    name: &str,
    selector: &BTreeMap<String, String>,
    ports: &[(&str, i32)],
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(selector.clone()),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector.clone()),
            ports: Some(service_ports(ports, None)),
            // Members must resolve each other before they report ready
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the client-facing service
pub fn generate_external_service(
    cluster: &StarRocksCluster,
    name: &str,
    selector: &BTreeMap<String, String>,
    ports: &[(&str, i32)],
    expose: Option<&ExposeSpec>,
) -> Service {
    let service_type = expose.map(|e| e.type_).unwrap_or_default();
    let annotations = expose.map(|e| e.annotations.clone()).unwrap_or_default();

    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: cluster.namespace(),
            labels: Some(selector.clone()),
            annotations: non_empty(annotations),
            owner_references: Some(vec![owner_reference(cluster)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(selector.clone()),
            ports: Some(service_ports(ports, expose)),
            load_balancer_ip: expose.and_then(|e| e.load_balancer_ip.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
