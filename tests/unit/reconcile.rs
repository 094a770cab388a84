//! Full reconcile passes against the in-memory API server

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;

use starrocks_operator::controller::apply::{
    RESTART_STATE_ANNOTATION, RESTART_STATE_FINISHED, apply_statefulset,
};
use starrocks_operator::controller::components::{
    BeController, CnController, RESTART_FINISHED, RESTART_REQUESTED, SubController, SyncOutcome,
};
use starrocks_operator::controller::status::condition_types;
use starrocks_operator::controller::{Context, Error, FINALIZER, reconcile};
use starrocks_operator::crd::{ClusterPhase, ComponentPhase, StarRocksCluster};
use starrocks_operator::resources::{Be, Cn, ComponentKind, Fe};

use crate::common::*;

const CN_HOST: &str = "kube-cn-0.kube-cn-search.db.svc.cluster.local";
const OTHER_CN_HOST: &str = "other-cn-0.other-cn-search.db.svc.cluster.local";

fn bare_statefulset(name: String) -> StatefulSet {
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn bare_service(name: String) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn context(client: FakeClient) -> Arc<Context<FakeClient>> {
    Arc::new(test_context(client, Arc::new(FakeNodeRegistry::default())))
}

/// The cluster as the next watch event would deliver it
fn with_last_status(mut cluster: StarRocksCluster, ctx: &Context<FakeClient>) -> StarRocksCluster {
    cluster.status = ctx.client.last_status();
    cluster
}

#[tokio::test]
async fn test_fe_only_cluster_converges_and_settles() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_fe(3).build();
    seed_ready_pods::<Fe>(&client, &cluster, 3);
    let ctx = context(client);

    let action = reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(60)));

    let sts: StatefulSet = ctx.client.object("db", "kube-fe").unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(3));
    assert!(ctx.client.object::<Service>("db", "kube-fe-search").is_some());
    assert!(ctx.client.object::<Service>("db", "kube-fe-service").is_some());

    let status = ctx.client.last_status().unwrap();
    assert_eq!(status.phase, ClusterPhase::Running);
    assert_eq!(status.observed_generation, Some(1));
    let fe = status.star_rocks_fe_status.as_ref().unwrap();
    assert_eq!(fe.phase, ComponentPhase::Running);
    assert_eq!(fe.running_instances, vec!["kube-fe-0", "kube-fe-1", "kube-fe-2"]);
    assert_eq!(fe.service_name.as_deref(), Some("kube-fe-service"));
    assert!(status.star_rocks_be_status.is_none());

    // A second pass over the same spec writes nothing
    ctx.client.clear_writes();
    let patches = ctx.client.status_patches().len();
    let cluster = with_last_status(cluster, &ctx);
    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert!(ctx.client.writes().is_empty(), "{:?}", ctx.client.writes());
    assert_eq!(ctx.client.status_patches().len(), patches);
}

#[tokio::test]
async fn test_missing_replicas_keep_cluster_pending() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_fe(3).build();
    seed_ready_pods::<Fe>(&client, &cluster, 1);
    let ctx = context(client);

    let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(10)));

    let status = ctx.client.last_status().unwrap();
    assert_eq!(status.phase, ClusterPhase::Pending);
    assert_eq!(
        status.reason.as_deref(),
        Some("1 of 3 replicas ready, 0 creating")
    );
}

#[tokio::test]
async fn test_recovered_cluster_drops_stale_reason() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_fe(3).build();
    seed_ready_pods::<Fe>(&client, &cluster, 1);
    let ctx = context(client);

    reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();
    let status = ctx.client.last_status().unwrap();
    assert_eq!(status.phase, ClusterPhase::Pending);
    assert!(status.reason.is_some());

    seed_ready_pods::<Fe>(&ctx.client, &cluster, 3);
    let cluster = with_last_status(cluster, &ctx);
    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();

    let status = ctx.client.last_status().unwrap();
    assert_eq!(status.phase, ClusterPhase::Running);
    assert_eq!(status.reason, None);
    let fe = status.star_rocks_fe_status.unwrap();
    assert_eq!(fe.reason, None);
    assert!(fe.creating_instances.is_empty());
}

#[tokio::test]
async fn test_finalizer_added_first() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .without_finalizer()
        .build();
    let ctx = context(client);

    let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(1)));

    let patches = ctx.client.metadata_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].finalizers, Some(vec![FINALIZER.to_string()]));
    assert!(ctx.client.writes().is_empty());
}

#[tokio::test]
async fn test_backends_wait_for_fe_endpoints() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_fe(1).with_be(3).build();
    let ctx = context(client);

    let outcome = BeController.sync(&ctx, &cluster).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Waiting(_)));
    assert!(ctx.client.writes().is_empty());

    ctx.client.insert("db", ready_fe_endpoints(&cluster));
    let outcome = BeController.sync(&ctx, &cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    let sts: StatefulSet = ctx.client.object("db", "kube-be").unwrap();
    assert_eq!(sts.spec.unwrap().replicas, Some(3));
}

#[tokio::test]
async fn test_compute_nodes_synced_once_fe_serves() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_fe(1).with_cn(2).build();
    client.insert("db", ready_fe_endpoints(&cluster));
    let ctx = context(client);

    let outcome = CnController.sync(&ctx, &cluster).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced);
    for name in ["kube-cn-search", "kube-cn-service"] {
        assert!(ctx.client.object::<Service>("db", name).is_some(), "{}", name);
    }
    let sts: StatefulSet = ctx.client.object("db", "kube-cn").unwrap();
    assert_eq!(sts.labels(), &Cn::labels("kube"));
}

#[tokio::test]
async fn test_component_removed_from_spec_is_cleared() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_fe(1).with_be(1).build();
    client.insert("db", ready_fe_endpoints(&cluster));
    let ctx = context(client);

    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert!(ctx.client.object::<StatefulSet>("db", "kube-be").is_some());

    let without_be = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_generation(2)
        .build();
    reconcile(Arc::new(without_be), ctx.clone()).await.unwrap();

    assert!(ctx.client.object::<StatefulSet>("db", "kube-be").is_none());
    assert!(ctx.client.object::<Service>("db", "kube-be-search").is_none());
    assert!(ctx.client.object::<Service>("db", "kube-be-service").is_none());
    assert!(ctx.client.object::<StatefulSet>("db", "kube-fe").is_some());
    assert!(
        ctx.client
            .last_status()
            .unwrap()
            .star_rocks_be_status
            .is_none()
    );
}

#[tokio::test]
async fn test_component_without_image_fails_the_pass() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_be_spec(component_spec("", Some(3)))
        .build();
    client.insert("db", ready_fe_endpoints(&cluster));
    let ctx = context(client);

    let err = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap_err();
    assert!(matches!(err, Error::ValidationError(_)), "{:?}", err);
    assert!(!err.is_retryable());

    // The FE synced before the BE check stopped the pass
    assert!(ctx.client.object::<StatefulSet>("db", "kube-fe").is_some());
    assert!(ctx.client.object::<StatefulSet>("db", "kube-be").is_none());
    let status = ctx.client.last_status().unwrap();
    assert_eq!(status.phase, ClusterPhase::Failed);
    assert!(
        status
            .reason
            .as_deref()
            .unwrap()
            .contains("be is declared without an image")
    );
}

#[tokio::test]
async fn test_deletion_drops_compute_nodes_then_releases_finalizer() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_cn(1)
        .deleting()
        .build();
    client.insert("db", ready_fe_endpoints(&cluster));
    client.insert("db", bare_statefulset(Cn::default_resource_name("kube")));
    let registry = Arc::new(FakeNodeRegistry::with_nodes(&[CN_HOST, OTHER_CN_HOST]));
    let ctx = Arc::new(test_context(client, registry.clone()));

    let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());

    assert_eq!(registry.dropped(), vec![format!("{}:9050", CN_HOST)]);
    assert!(ctx.client.object::<StatefulSet>("db", "kube-cn").is_none());

    let patches = ctx.client.metadata_patches();
    assert_eq!(patches.last().unwrap().finalizers, Some(Vec::new()));
    assert_eq!(
        ctx.client.status_patches()[0].phase,
        ClusterPhase::Deleting
    );
}

#[tokio::test]
async fn test_unreachable_registry_holds_deletion() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_cn(1)
        .deleting()
        .build();
    client.insert("db", ready_fe_endpoints(&cluster));
    client.insert("db", bare_statefulset(Fe::default_resource_name("kube")));
    client.insert("db", bare_service(Fe::external_service_name("kube")));
    client.insert("db", bare_statefulset(Cn::default_resource_name("kube")));
    let registry = Arc::new(FakeNodeRegistry::with_nodes(&[CN_HOST]));
    registry.set_failing(true);
    let ctx = Arc::new(test_context(client, registry.clone()));

    let action = reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    assert!(ctx.client.metadata_patches().is_empty());
    // The FE must outlive the compute nodes registered with it
    assert!(ctx.client.object::<StatefulSet>("db", "kube-fe").is_some());
    assert!(ctx.client.object::<Service>("db", "kube-fe-service").is_some());
    assert!(ctx.client.object::<StatefulSet>("db", "kube-cn").is_some());

    registry.set_failing(false);
    let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert_eq!(registry.dropped(), vec![format!("{}:9050", CN_HOST)]);
    assert!(ctx.client.object::<StatefulSet>("db", "kube-cn").is_none());
    assert!(ctx.client.object::<StatefulSet>("db", "kube-fe").is_none());
}

#[tokio::test]
async fn test_deletion_without_fe_skips_deregistration() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db").with_cn(1).deleting().build();
    let registry = Arc::new(FakeNodeRegistry::with_nodes(&[CN_HOST]));
    registry.set_failing(true);
    let ctx = Arc::new(test_context(client, registry.clone()));

    let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(registry.dropped().is_empty());
}

/// The StatefulSet controller reports the FE template fully rolled out
fn mark_rolled_out(client: &FakeClient) {
    let mut sts: StatefulSet = client.object("db", "kube-fe").unwrap();
    sts.status = Some(StatefulSetStatus {
        observed_generation: sts.metadata.generation,
        current_revision: Some("kube-fe-7d9f".to_string()),
        update_revision: Some("kube-fe-7d9f".to_string()),
        replicas: 1,
        ..Default::default()
    });
    client.insert("db", sts);
}

#[tokio::test]
async fn test_rolling_restart_finishes_after_rollout() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_annotation(&Fe::restart_annotation(), RESTART_REQUESTED)
        .build();
    seed_ready_pods::<Fe>(&client, &cluster, 1);
    let ctx = context(client);

    reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();
    // The StatefulSet controller has not rolled the new template out yet
    assert!(ctx.client.metadata_patches().is_empty());

    mark_rolled_out(&ctx.client);

    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
    let patches = ctx.client.metadata_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0].annotations.get(&Fe::restart_annotation()),
        Some(&Some(RESTART_FINISHED.to_string()))
    );
    let sts: StatefulSet = ctx.client.object("db", "kube-fe").unwrap();
    assert_eq!(
        sts.annotations().get(RESTART_STATE_ANNOTATION).map(String::as_str),
        Some(RESTART_STATE_FINISHED)
    );

    // Once finished, the marker alone does not restart again
    ctx.client.clear_writes();
    let finished = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_annotation(&Fe::restart_annotation(), RESTART_FINISHED)
        .build();
    reconcile(Arc::new(finished), ctx.clone()).await.unwrap();
    assert!(ctx.client.writes().is_empty(), "{:?}", ctx.client.writes());
}

#[tokio::test(start_paused = true)]
async fn test_restart_finish_survives_concurrent_workload_write() {
    let client = FakeClient::new();
    let cluster = ClusterBuilder::new("kube", "db")
        .with_fe(1)
        .with_annotation(&Fe::restart_annotation(), RESTART_REQUESTED)
        .build();
    seed_ready_pods::<Fe>(&client, &cluster, 1);
    let ctx = context(client);

    reconcile(Arc::new(cluster.clone()), ctx.clone()).await.unwrap();
    mark_rolled_out(&ctx.client);

    // A status write lands between our read and our replace
    ctx.client.inject_conflicts(1);
    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();

    let sts: StatefulSet = ctx.client.object("db", "kube-fe").unwrap();
    assert_eq!(
        sts.annotations().get(RESTART_STATE_ANNOTATION).map(String::as_str),
        Some(RESTART_STATE_FINISHED)
    );
}

#[tokio::test]
async fn test_refused_shrink_reported_on_status() {
    let client = FakeClient::new();
    client.add_storage_class(storage_class("gp3", "ebs.csi.aws.com", true));
    let cluster = be_cluster_with_volume(2, Some("gp3"), "10Gi");
    client.insert("db", ready_fe_endpoints(&cluster));
    let live = be_statefulset(&be_cluster_with_volume(2, Some("gp3"), "20Gi"));
    apply_statefulset(&client, &CancellationToken::new(), "db", &live, false)
        .await
        .unwrap();
    seed_ready_pods::<Fe>(&client, &cluster, 1);
    seed_ready_pods::<Be>(&client, &cluster, 2);
    let ctx = context(client);

    reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();

    let status = ctx.client.last_status().unwrap();
    let condition = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::STORAGE_EXPANSION)
        .unwrap();
    assert_eq!(condition.status, "False");
    assert!(condition.message.contains("shrinking from 20Gi to 10Gi"));
    // The rest of the cluster still converges
    assert_eq!(status.phase, ClusterPhase::Running);
}
