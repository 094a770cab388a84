//! Storage expansion against the in-memory API server

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use tokio_util::sync::CancellationToken;

use starrocks_operator::controller::Error;
use starrocks_operator::controller::apply::apply_statefulset;
use starrocks_operator::controller::client::Propagation;
use starrocks_operator::controller::storage_expansion::{detect_expansion, sync_statefulset};
use starrocks_operator::crd::StarRocksCluster;
use starrocks_operator::resources::statefulset::claim_storage_request;
use starrocks_operator::resources::{Be, ComponentKind};

use crate::common::*;

const CLAIMS: [&str; 2] = ["data-kube-be-0", "data-kube-be-1"];

/// A running two-replica BE with `data` claims of `size` in `class`
async fn seed_running_be(client: &FakeClient, class: &str, size: &str) -> StarRocksCluster {
    let cluster = be_cluster_with_volume(2, Some(class), size);
    let desired = be_statefulset(&cluster);
    apply_statefulset(client, &CancellationToken::new(), "db", &desired, false)
        .await
        .unwrap();

    let labels = Be::labels("kube");
    for (i, claim) in CLAIMS.iter().enumerate() {
        client.insert("db", bound_pvc(claim, "db", size, Some(class)));
        client.insert(
            "db",
            pod_with_claims(&format!("kube-be-{}", i), "db", &labels, &[claim]),
        );
    }
    client.clear_writes();
    cluster
}

fn desired_with_size(class: Option<&str>, size: &str) -> StatefulSet {
    be_statefulset(&be_cluster_with_volume(2, class, size))
}

fn claim_template_size(sts: &StatefulSet) -> String {
    let claims = sts.spec.as_ref().unwrap().volume_claim_templates.as_ref().unwrap();
    claim_storage_request(&claims[0]).unwrap().to_string()
}

fn claim_sizes(client: &FakeClient) -> Vec<String> {
    CLAIMS
        .iter()
        .map(|name| {
            let pvc: PersistentVolumeClaim = client.object("db", name).unwrap();
            claim_storage_request(&pvc).unwrap().to_string()
        })
        .collect()
}

fn write_summary(client: &FakeClient) -> Vec<(String, String)> {
    client
        .writes()
        .iter()
        .map(|w| {
            let action = match w {
                Write::Create { .. } => "create".to_string(),
                Write::Replace { .. } => "replace".to_string(),
                Write::Delete { propagation, .. } => format!("delete:{:?}", propagation),
            };
            (w.kind().to_string(), action)
        })
        .collect()
}

#[tokio::test]
async fn test_unknown_provisioner_expands_with_detachment() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("local-ssd", "example.com/local-disk", true));
    seed_running_be(&client, "local-ssd", "10Gi").await;

    let errors = sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        desired_with_size(Some("local-ssd"), "20Gi"),
        false,
    )
    .await
    .unwrap();
    assert!(errors.is_empty());

    assert_eq!(
        write_summary(&client),
        vec![
            ("StatefulSet".to_string(), "delete:Background".to_string()),
            ("PersistentVolumeClaim".to_string(), "replace".to_string()),
            ("PersistentVolumeClaim".to_string(), "replace".to_string()),
            ("StatefulSet".to_string(), "create".to_string()),
        ]
    );
    assert_eq!(claim_sizes(&client), vec!["20Gi", "20Gi"]);

    let recreated: StatefulSet = client.object("db", "kube-be").unwrap();
    assert_eq!(claim_template_size(&recreated), "20Gi");
    assert_eq!(recreated.spec.as_ref().unwrap().replicas, Some(2));
    // Pods went away with the workload and come back from the new one
    assert!(client.objects::<Pod>("db").is_empty());
}

#[tokio::test]
async fn test_online_provisioner_keeps_pods_running() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("gp3", "ebs.csi.aws.com", true));
    seed_running_be(&client, "gp3", "10Gi").await;

    let errors = sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        desired_with_size(Some("gp3"), "20Gi"),
        false,
    )
    .await
    .unwrap();
    assert!(errors.is_empty());

    assert_eq!(
        write_summary(&client),
        vec![
            ("PersistentVolumeClaim".to_string(), "replace".to_string()),
            ("PersistentVolumeClaim".to_string(), "replace".to_string()),
            ("StatefulSet".to_string(), "delete:Orphan".to_string()),
            ("StatefulSet".to_string(), "create".to_string()),
        ]
    );
    assert_eq!(claim_sizes(&client), vec!["20Gi", "20Gi"]);
    assert_eq!(client.objects::<Pod>("db").len(), 2);
}

#[tokio::test]
async fn test_shrink_is_refused_and_pinned() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("gp3", "ebs.csi.aws.com", true));
    seed_running_be(&client, "gp3", "20Gi").await;

    let errors = sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        desired_with_size(Some("gp3"), "10Gi"),
        false,
    )
    .await
    .unwrap();

    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("shrinking from 20Gi to 10Gi"), "{}", errors[0]);
    assert!(client.writes().is_empty());
    let live: StatefulSet = client.object("db", "kube-be").unwrap();
    assert_eq!(claim_template_size(&live), "20Gi");
    assert_eq!(claim_sizes(&client), vec!["20Gi", "20Gi"]);
}

#[tokio::test]
async fn test_class_without_expansion_is_refused() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("fixed", "ebs.csi.aws.com", false));
    seed_running_be(&client, "fixed", "10Gi").await;

    let errors = sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        desired_with_size(Some("fixed"), "20Gi"),
        false,
    )
    .await
    .unwrap();

    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("does not allow volume expansion"));
    assert!(client.writes().is_empty());
}

#[tokio::test]
async fn test_default_class_resolves_unset_class() {
    let client = FakeClient::new();
    client.add_storage_class(default_storage_class("standard", "pd.csi.storage.gke.io", true));
    let cluster = be_cluster_with_volume(2, None, "10Gi");
    let live = be_statefulset(&cluster);
    for claim in CLAIMS {
        client.insert("db", bound_pvc(claim, "db", "10Gi", Some("standard")));
    }

    let desired = desired_with_size(None, "20Gi");
    let claims = desired
        .spec
        .as_ref()
        .unwrap()
        .volume_claim_templates
        .clone()
        .unwrap();
    let plan = detect_expansion(&client, &live, &claims).await.unwrap();

    assert!(plan.errors.is_empty());
    assert!(!plan.requires_detachment);
    assert!(plan.only_size_changed);
    let names: Vec<&str> = plan.pvcs.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, CLAIMS.to_vec());
}

#[tokio::test]
async fn test_new_claim_template_recreates_without_touching_pods() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("gp3", "ebs.csi.aws.com", true));
    seed_running_be(&client, "gp3", "10Gi").await;

    let mut spec = component_spec(BE_IMAGE, Some(2));
    spec.storage_volumes = vec![
        storage_volume("data", Some("gp3"), "10Gi"),
        storage_volume("spill", Some("gp3"), "50Gi"),
    ];
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_be_spec(spec)
        .build();

    sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        be_statefulset(&cluster),
        false,
    )
    .await
    .unwrap();

    assert_eq!(
        write_summary(&client),
        vec![
            ("StatefulSet".to_string(), "delete:Orphan".to_string()),
            ("StatefulSet".to_string(), "create".to_string()),
        ]
    );
    let recreated: StatefulSet = client.object("db", "kube-be").unwrap();
    let templates = recreated
        .spec
        .unwrap()
        .volume_claim_templates
        .unwrap();
    assert_eq!(templates.len(), 2);
    assert_eq!(client.objects::<Pod>("db").len(), 2);
}

#[tokio::test]
async fn test_stuck_detachment_times_out_and_resumes() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("local-ssd", "example.com/local-disk", true));
    seed_running_be(&client, "local-ssd", "10Gi").await;
    // A pod outside the workload keeps one claim mounted
    client.insert(
        "db",
        pod_with_claims("debug-shell", "db", &Default::default(), &["data-kube-be-0"]),
    );

    let err = sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        desired_with_size(Some("local-ssd"), "20Gi"),
        false,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{:?}", err);
    assert!(client.object::<StatefulSet>("db", "kube-be").is_none());
    assert_eq!(claim_sizes(&client), vec!["10Gi", "10Gi"]);

    // The next pass finds no workload, finishes the resize and recreates it
    client.clear_writes();
    sync_statefulset(
        &client,
        &CancellationToken::new(),
        &fast_expansion(),
        desired_with_size(Some("local-ssd"), "20Gi"),
        false,
    )
    .await
    .unwrap();
    assert_eq!(claim_sizes(&client), vec!["20Gi", "20Gi"]);
    let recreated: StatefulSet = client.object("db", "kube-be").unwrap();
    assert_eq!(claim_template_size(&recreated), "20Gi");
}

#[tokio::test]
async fn test_cancellation_aborts_detachment() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("local-ssd", "example.com/local-disk", true));
    seed_running_be(&client, "local-ssd", "10Gi").await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = sync_statefulset(
        &client,
        &cancel,
        &fast_expansion(),
        desired_with_size(Some("local-ssd"), "20Gi"),
        false,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(claim_sizes(&client), vec!["10Gi", "10Gi"]);
    assert!(!client.writes().iter().any(|w| matches!(
        w,
        Write::Delete {
            propagation: Propagation::Orphan,
            ..
        }
    )));
}
