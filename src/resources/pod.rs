//! Pod template generation for FE, BE and CN workloads

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ExecAction, HTTPGetAction, HostPathVolumeSource, KeyToPath, Lifecycle, LifecycleHandler,
    ObjectFieldSelector, PodSpec, PodTemplateSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{ComponentSpec, HOST_PATH_STORAGE, StarRocksCluster};
use crate::resources::common::{non_empty, resource_requirements};
use crate::starrocks::{BackendPorts, FePorts};

/// Health endpoint served by every component on its http port
pub const HEALTH_PATH: &str = "/api/health";

/// Name of the configuration volume
const CONFIG_VOLUME: &str = "config";

/// Resolved ports of one component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentPorts {
    Fe(FePorts),
    Be(BackendPorts),
    Cn(BackendPorts),
}

impl ComponentPorts {
    /// Component short name
    pub fn component(&self) -> &'static str {
        match self {
            ComponentPorts::Fe(_) => "fe",
            ComponentPorts::Be(_) => "be",
            ComponentPorts::Cn(_) => "cn",
        }
    }

    /// Named ports exposed by the container and its services
    pub fn named_ports(&self) -> Vec<(&'static str, i32)> {
        match self {
            ComponentPorts::Fe(p) => vec![
                ("http-port", p.http),
                ("rpc-port", p.rpc),
                ("query-port", p.query),
                ("edit-log-port", p.edit_log),
            ],
            ComponentPorts::Be(p) => vec![
                ("be-port", p.thrift),
                ("webserver-port", p.webserver),
                ("heartbeat-port", p.heartbeat),
                ("brpc-port", p.brpc),
            ],
            ComponentPorts::Cn(p) => vec![
                ("thrift-port", p.thrift),
                ("webserver-port", p.webserver),
                ("heartbeat-port", p.heartbeat),
                ("brpc-port", p.brpc),
            ],
        }
    }

    /// Port serving [`HEALTH_PATH`]
    pub fn health_port(&self) -> i32 {
        match self {
            ComponentPorts::Fe(p) => p.http,
            ComponentPorts::Be(p) | ComponentPorts::Cn(p) => p.webserver,
        }
    }
}

/// Inputs of the workload synthesizers for one component
#[derive(Clone, Debug)]
pub struct ComponentParams<'a> {
    pub cluster: &'a StarRocksCluster,
    pub spec: &'a ComponentSpec,
    pub ports: ComponentPorts,
    /// Ports of the FE the component registers with
    pub fe_ports: FePorts,
    /// Selector labels of the component
    pub labels: BTreeMap<String, String>,
    /// Main workload name
    pub workload_name: String,
    /// Headless service giving pods stable DNS names
    pub search_service: String,
    /// Client-facing FE service
    pub fe_service: String,
}

impl ComponentParams<'_> {
    pub fn component(&self) -> &'static str {
        self.ports.component()
    }

    fn install_dir(&self) -> String {
        format!("/opt/starrocks/{}", self.component())
    }

    fn config_mount_path(&self) -> String {
        format!("/etc/starrocks/{}/conf", self.component())
    }
}

/// Generate the pod template for a component workload
pub fn generate_pod_template(params: &ComponentParams) -> PodTemplateSpec {
    let component = params.component();

    // Selector labels always win over user-provided ones
    let mut labels = params.spec.pod_labels.clone();
    labels.extend(params.labels.clone());

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if let Some(info) = &params.spec.config_map_info {
        volumes.push(Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: info.config_map_name.clone(),
                items: Some(vec![KeyToPath {
                    key: info.resolve_key.clone(),
                    path: format!("{}.conf", component),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: params.config_mount_path(),
            ..Default::default()
        });
    }

    for volume in &params.spec.storage_volumes {
        mounts.push(VolumeMount {
            name: volume.name.clone(),
            mount_path: volume.mount_path.clone(),
            ..Default::default()
        });
        if !volume.is_ephemeral() {
            // Backed by a claim template on the StatefulSet
            continue;
        }
        let mut pod_volume = Volume {
            name: volume.name.clone(),
            ..Default::default()
        };
        if volume.storage_class_name.as_deref() == Some(HOST_PATH_STORAGE) {
            pod_volume.host_path = Some(HostPathVolumeSource {
                path: volume
                    .host_path
                    .clone()
                    .unwrap_or_else(|| volume.mount_path.clone()),
                type_: Some("DirectoryOrCreate".to_string()),
            });
        } else {
            pod_volume.empty_dir = Some(EmptyDirVolumeSource::default());
        }
        volumes.push(pod_volume);
    }

    let health_check = |period: i32, failure_threshold: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(params.ports.health_port()),
            ..Default::default()
        }),
        period_seconds: Some(period),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    };

    let container = Container {
        name: component.to_string(),
        image: Some(params.spec.image.clone()),
        command: Some(vec![format!(
            "{}/{}_entrypoint.sh",
            params.install_dir(),
            component
        )]),
        args: Some(vec!["$(FE_SERVICE_NAME)".to_string()]),
        ports: Some(
            params
                .ports
                .named_ports()
                .into_iter()
                .map(|(name, port)| ContainerPort {
                    name: Some(name.to_string()),
                    container_port: port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        env: Some(component_env(params)),
        resources: resource_requirements(params.spec.resources.as_ref()),
        volume_mounts: if mounts.is_empty() { None } else { Some(mounts) },
        startup_probe: Some(health_check(5, 60)),
        liveness_probe: Some(health_check(5, 3)),
        readiness_probe: Some(health_check(5, 3)),
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![format!(
                        "{}/{}_prestop.sh",
                        params.install_dir(),
                        component
                    )]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: non_empty(params.spec.pod_annotations.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            service_account_name: params.spec.service_account.clone(),
            termination_grace_period_seconds: Some(120),
            ..Default::default()
        }),
    }
}

/// Environment shared by every component container
pub fn component_env(params: &ComponentParams) -> Vec<EnvVar> {
    let field = |name: &str, path: &str| EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let value = |name: &str, value: String| EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    };

    let namespace = params.cluster.namespace().unwrap_or_default();
    let mut env = vec![
        field("POD_NAME", "metadata.name"),
        field("POD_NAMESPACE", "metadata.namespace"),
        field("POD_IP", "status.podIP"),
        field("HOST_IP", "status.hostIP"),
        value("HOST_TYPE", "FQDN".to_string()),
        value("COMPONENT_NAME", params.component().to_string()),
        value(
            "FE_SERVICE_NAME",
            format!("{}.{}", params.fe_service, namespace),
        ),
        value("FE_QUERY_PORT", params.fe_ports.query.to_string()),
        value("SERVICE_NAME", params.search_service.clone()),
        value("CONFIGMAP_MOUNT_PATH", params.config_mount_path()),
    ];

    // User entries override the defaults above
    for (name, val) in &params.spec.env {
        env.retain(|e| &e.name != name);
        env.push(value(name, val.clone()));
    }
    env
}
