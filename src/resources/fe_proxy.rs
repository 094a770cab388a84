//! nginx proxy placed in front of the FE http port
//!
//! Stream-load clients talk to the proxy, which forwards to the FE service
//! and follows its redirects to BE nodes inside the cluster network.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, Service, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{FeProxySpec, StarRocksCluster};
use crate::resources::common::{deterministic_hash, owner_reference, resource_requirements};
use crate::resources::service::generate_external_service;
use crate::resources::statefulset::EXTERNALLY_SCALED_ANNOTATION;

/// Port the proxy listens on
pub const PROXY_PORT: i32 = 8080;

/// Pod annotation carrying the hash of the rendered nginx configuration
pub const CONFIG_HASH_ANNOTATION: &str = "starrocks.com/config-hash";

const DEFAULT_RESOLVER: &str = "kube-dns.kube-system.svc.cluster.local";
const NGINX_CONF_KEY: &str = "nginx.conf";

/// Inputs of the proxy synthesizers
#[derive(Clone, Debug)]
pub struct ProxyParams<'a> {
    pub cluster: &'a StarRocksCluster,
    pub spec: &'a FeProxySpec,
    pub labels: BTreeMap<String, String>,
    pub name: String,
    /// Client-facing FE service the proxy forwards to
    pub fe_service: String,
    pub fe_http_port: i32,
}

/// ConfigMap holding the nginx configuration of proxy `name`
pub fn proxy_config_map_name(name: &str) -> String {
    format!("{}-nginx", name)
}

impl ProxyParams<'_> {
    pub fn config_map_name(&self) -> String {
        proxy_config_map_name(&self.name)
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.name)
    }
}

/// Render the nginx configuration
pub fn render_nginx_conf(params: &ProxyParams) -> String {
    let namespace = params.cluster.namespace().unwrap_or_default();
    let resolver = params.spec.resolver.as_deref().unwrap_or(DEFAULT_RESOLVER);
    format!(
        r#"worker_processes auto;
events {{
  worker_connections 1024;
}}
http {{
  resolver {resolver} valid=10s;
  client_max_body_size 0;
  proxy_request_buffering off;
  server {{
    listen {port};
    location /nginx/health {{
      return 200 'ok';
    }}
    location / {{
      set $fe http://{fe}.{namespace}.svc.cluster.local:{fe_port};
      proxy_pass $fe;
      proxy_set_header Host $host;
      proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
      proxy_intercept_errors on;
      error_page 307 = @redirect;
    }}
    location @redirect {{
      set $redirect $upstream_http_location;
      proxy_pass $redirect;
    }}
  }}
}}
"#,
        resolver = resolver,
        port = PROXY_PORT,
        fe = params.fe_service,
        namespace = namespace,
        fe_port = params.fe_http_port,
    )
}

/// Generate the ConfigMap holding `nginx.conf`
pub fn generate_proxy_config_map(params: &ProxyParams) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(params.config_map_name()),
            namespace: params.cluster.namespace(),
            labels: Some(params.labels.clone()),
            owner_references: Some(vec![owner_reference(params.cluster)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            NGINX_CONF_KEY.to_string(),
            render_nginx_conf(params),
        )])),
        ..Default::default()
    }
}

/// Generate the proxy Deployment.
///
/// The pod template carries the configuration hash so a changed
/// configuration rolls the pods.
pub fn generate_proxy_deployment(params: &ProxyParams) -> Deployment {
    let conf_hash = deterministic_hash(render_nginx_conf(params).as_bytes());

    let health_check = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/nginx/health".to_string()),
            port: IntOrString::Int(PROXY_PORT),
            ..Default::default()
        }),
        period_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    };

    let container = Container {
        name: "fe-proxy".to_string(),
        image: Some(params.spec.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http-port".to_string()),
            container_port: PROXY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: resource_requirements(params.spec.resources.as_ref()),
        volume_mounts: Some(vec![VolumeMount {
            name: "nginx-conf".to_string(),
            mount_path: "/etc/nginx/nginx.conf".to_string(),
            sub_path: Some(NGINX_CONF_KEY.to_string()),
            read_only: Some(true),
            ..Default::default()
        }]),
        liveness_probe: Some(health_check.clone()),
        readiness_probe: Some(health_check),
        ..Default::default()
    };

    // A null replica count belongs to whoever scales the proxy
    let annotations = params.spec.replicas.is_none().then(|| {
        BTreeMap::from([(EXTERNALLY_SCALED_ANNOTATION.to_string(), "true".to_string())])
    });

    Deployment {
        metadata: ObjectMeta {
            name: Some(params.name.clone()),
            namespace: params.cluster.namespace(),
            labels: Some(params.labels.clone()),
            annotations,
            owner_references: Some(vec![owner_reference(params.cluster)]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: params.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(params.labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(params.labels.clone()),
                    annotations: Some(BTreeMap::from([(
                        CONFIG_HASH_ANNOTATION.to_string(),
                        conf_hash,
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "nginx-conf".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: params.config_map_name(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the proxy's client-facing service
pub fn generate_proxy_service(params: &ProxyParams) -> Service {
    generate_external_service(
        params.cluster,
        &params.service_name(),
        &params.labels,
        &[("http-port", PROXY_PORT)],
        params.spec.service.as_ref(),
    )
}
