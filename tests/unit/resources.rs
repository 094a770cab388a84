//! Unit tests for resource generators

use std::collections::BTreeMap;

use kube::ResourceExt;

use starrocks_operator::crd::{
    AutoScalingPolicy, AutoscalingVersion, ComponentSpec, ScalingMetric, ScalingResource,
    ScheduledJobSpec, StarRocksCluster,
};
use starrocks_operator::resources::autoscaler::{Autoscaler, generate_autoscaler};
use starrocks_operator::resources::cron_job::{SCHEDULED_JOB_LABEL, generate_cron_jobs};
use starrocks_operator::resources::pod::{ComponentParams, ComponentPorts};
use starrocks_operator::resources::service::{generate_external_service, generate_search_service};
use starrocks_operator::resources::statefulset::{
    EXTERNALLY_SCALED_ANNOTATION, generate_statefulset,
};
use starrocks_operator::resources::{Be, Cn, ComponentKind, Fe, label_selector};
use starrocks_operator::starrocks::{BackendPorts, FePorts};

use crate::common::*;

fn params<'a, K: ComponentKind>(
    cluster: &'a StarRocksCluster,
    spec: &'a ComponentSpec,
    ports: ComponentPorts,
) -> ComponentParams<'a> {
    let cluster_name = cluster.name_any();
    ComponentParams {
        cluster,
        spec,
        ports,
        fe_ports: FePorts::default(),
        labels: K::labels(&cluster_name),
        workload_name: K::default_resource_name(&cluster_name),
        search_service: K::search_service_name(&cluster_name),
        fe_service: Fe::external_service_name(&cluster_name),
    }
}

mod statefulset_tests {
    use super::*;

    #[test]
    fn test_fe_statefulset_naming_and_policy() {
        let cluster = ClusterBuilder::new("kube", "db").with_fe(3).build();
        let spec = cluster.spec.star_rocks_fe_spec.clone().unwrap();
        let sts = generate_statefulset(&params::<Fe>(
            &cluster,
            &spec,
            ComponentPorts::Fe(FePorts::default()),
        ));

        assert_eq!(sts.name_any(), "kube-fe");
        assert_eq!(sts.namespace().as_deref(), Some("db"));
        let sts_spec = sts.spec.as_ref().unwrap();
        assert_eq!(sts_spec.replicas, Some(3));
        assert_eq!(sts_spec.service_name.as_deref(), Some("kube-fe-search"));
        assert_eq!(sts_spec.pod_management_policy.as_deref(), Some("OrderedReady"));
        assert!(!sts.annotations().contains_key(EXTERNALLY_SCALED_ANNOTATION));

        let owner = &sts.owner_references()[0];
        assert_eq!(owner.kind, "StarRocksCluster");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn test_backend_statefulsets_start_in_parallel() {
        let cluster = ClusterBuilder::new("kube", "db").with_fe(1).with_be(3).build();
        let spec = cluster.spec.star_rocks_be_spec.clone().unwrap();
        let ports = ComponentPorts::Be(BackendPorts::resolve_be(&Default::default()));
        let sts = generate_statefulset(&params::<Be>(&cluster, &spec, ports));

        assert_eq!(sts.name_any(), "kube-be");
        assert_eq!(
            sts.spec.as_ref().unwrap().pod_management_policy.as_deref(),
            Some("Parallel")
        );
    }

    #[test]
    fn test_selector_matches_pod_labels() {
        let cluster = ClusterBuilder::new("kube", "db").with_fe(1).build();
        let mut spec = cluster.spec.star_rocks_fe_spec.clone().unwrap();
        // A user label cannot hijack the selector
        spec.pod_labels = BTreeMap::from([
            ("team".to_string(), "data".to_string()),
            ("app.kubernetes.io/component".to_string(), "other".to_string()),
        ]);
        let sts = generate_statefulset(&params::<Fe>(
            &cluster,
            &spec,
            ComponentPorts::Fe(FePorts::default()),
        ));

        let sts_spec = sts.spec.as_ref().unwrap();
        let selector = sts_spec.selector.match_labels.as_ref().unwrap();
        let pod_labels = sts_spec
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        for (k, v) in selector {
            assert_eq!(pod_labels.get(k), Some(v), "selector label {}", k);
        }
        assert_eq!(pod_labels.get("team").map(String::as_str), Some("data"));
    }

    #[test]
    fn test_ceded_replicas_are_omitted_and_marked() {
        let cluster = ClusterBuilder::new("kube", "db")
            .with_fe(1)
            .with_cn_spec(component_spec(CN_IMAGE, None))
            .build();
        let spec = cluster.spec.star_rocks_cn_spec.clone().unwrap();
        let ports = ComponentPorts::Cn(BackendPorts::resolve_cn(&Default::default()));
        let sts = generate_statefulset(&params::<Cn>(&cluster, &spec, ports));

        assert_eq!(sts.spec.as_ref().unwrap().replicas, None);
        assert_eq!(
            sts.annotations().get(EXTERNALLY_SCALED_ANNOTATION).map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_autoscaled_component_is_marked_even_with_replicas() {
        let mut spec = component_spec(CN_IMAGE, Some(2));
        spec.auto_scaling_policy = Some(AutoScalingPolicy {
            max_replicas: 10,
            ..Default::default()
        });
        let cluster = ClusterBuilder::new("kube", "db")
            .with_fe(1)
            .with_cn_spec(spec.clone())
            .build();
        let ports = ComponentPorts::Cn(BackendPorts::resolve_cn(&Default::default()));
        let sts = generate_statefulset(&params::<Cn>(&cluster, &spec, ports));

        assert_eq!(sts.spec.as_ref().unwrap().replicas, None);
        assert!(sts.annotations().contains_key(EXTERNALLY_SCALED_ANNOTATION));
    }

    #[test]
    fn test_claim_templates_only_for_persistent_volumes() {
        let mut spec = component_spec(BE_IMAGE, Some(1));
        spec.storage_volumes = vec![
            storage_volume("data", Some("standard"), "100Gi"),
            storage_volume("log", Some("emptyDir"), "1Gi"),
            storage_volume("cache", None, "0Gi"),
        ];
        let cluster = ClusterBuilder::new("kube", "db")
            .with_fe(1)
            .with_be_spec(spec.clone())
            .build();
        let ports = ComponentPorts::Be(BackendPorts::resolve_be(&Default::default()));
        let sts = generate_statefulset(&params::<Be>(&cluster, &spec, ports));

        let sts_spec = sts.spec.as_ref().unwrap();
        let claims = sts_spec.volume_claim_templates.as_ref().unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].name_any(), "data");

        let pod_volumes: Vec<String> = sts_spec
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .iter()
            .flatten()
            .map(|v| v.name.clone())
            .collect();
        assert_eq!(pod_volumes, vec!["log".to_string(), "cache".to_string()]);

        let retention = sts_spec
            .persistent_volume_claim_retention_policy
            .as_ref()
            .unwrap();
        assert_eq!(retention.when_deleted.as_deref(), Some("Retain"));
    }
}

mod service_tests {
    use super::*;

    #[test]
    fn test_fe_services_carry_named_ports() {
        let cluster = ClusterBuilder::new("kube", "db").with_fe(1).build();
        let labels = Fe::labels("kube");
        let ports = ComponentPorts::Fe(FePorts::default()).named_ports();

        let search = generate_search_service(&cluster, "kube-fe-search", &labels, &ports);
        let search_spec = search.spec.as_ref().unwrap();
        assert_eq!(search_spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(search_spec.publish_not_ready_addresses, Some(true));

        let external =
            generate_external_service(&cluster, "kube-fe-service", &labels, &ports, None);
        let port_numbers: Vec<i32> = external
            .spec
            .as_ref()
            .unwrap()
            .ports
            .iter()
            .flatten()
            .map(|p| p.port)
            .collect();
        assert_eq!(port_numbers, vec![8030, 9020, 9030, 9010]);
    }
}

mod autoscaler_tests {
    use super::*;

    fn policy(version: AutoscalingVersion) -> AutoScalingPolicy {
        AutoScalingPolicy {
            version,
            min_replicas: Some(1),
            max_replicas: 8,
            metrics: vec![
                ScalingMetric {
                    resource: ScalingResource::Memory,
                    target_average_utilization: 70,
                },
                ScalingMetric {
                    resource: ScalingResource::Cpu,
                    target_average_utilization: 60,
                },
            ],
        }
    }

    #[test]
    fn test_autoscaler_targets_workload() {
        let cluster = ClusterBuilder::new("kube", "db").with_fe(1).with_cn(1).build();
        let labels = Cn::labels("kube");

        match generate_autoscaler(
            &cluster,
            "kube-cn-autoscaler",
            "kube-cn",
            &labels,
            &policy(AutoscalingVersion::V1),
        ) {
            Autoscaler::V1(hpa) => {
                let spec = hpa.spec.unwrap();
                assert_eq!(spec.scale_target_ref.name, "kube-cn");
                assert_eq!(spec.scale_target_ref.kind, "StatefulSet");
                assert_eq!(spec.target_cpu_utilization_percentage, Some(60));
                assert_eq!(spec.max_replicas, 8);
            }
            other => panic!("expected a v1 autoscaler, got {:?}", other),
        }

        match generate_autoscaler(
            &cluster,
            "kube-cn-autoscaler",
            "kube-cn",
            &labels,
            &policy(AutoscalingVersion::V2),
        ) {
            Autoscaler::V2(hpa) => {
                assert_eq!(hpa.spec.unwrap().metrics.unwrap().len(), 2);
            }
            other => panic!("expected a v2 autoscaler, got {:?}", other),
        }
    }
}

mod cron_job_tests {
    use super::*;

    #[test]
    fn test_job_pods_stay_outside_workload_selector() {
        let mut spec = component_spec(FE_IMAGE, Some(1));
        spec.scheduled_jobs = vec![ScheduledJobSpec {
            name: "backup".to_string(),
            schedule: "0 3 * * *".to_string(),
            image: None,
            command: vec!["/opt/backup.sh".to_string()],
            args: vec![],
        }];
        let cluster = ClusterBuilder::new("kube", "db").build();
        let params = params::<Fe>(&cluster, &spec, ComponentPorts::Fe(FePorts::default()));

        let jobs = generate_cron_jobs(&params);
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.name_any(), "kube-fe-backup");
        assert_eq!(
            job.labels().get(SCHEDULED_JOB_LABEL).map(String::as_str),
            Some("backup")
        );

        let job_spec = job.spec.as_ref().unwrap();
        assert_eq!(job_spec.schedule, "0 3 * * *");
        let template = &job_spec.job_template.spec.as_ref().unwrap().template;
        let pod_labels = template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        let selector = Fe::labels("kube");
        assert!(
            !selector.iter().all(|(k, v)| pod_labels.get(k) == Some(v)),
            "job pods must not match {}",
            label_selector(&selector)
        );

        let container = &template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some(FE_IMAGE));
    }
}
