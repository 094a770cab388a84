//! Kubernetes client abstraction
//!
//! Everything the controllers do against the API server goes through
//! [`KubeClient`], so reconciliation can be exercised against an in-memory
//! implementation in tests while production uses [`KubeApiClient`].

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::controller::error::Result;
use crate::crd::{StarRocksCluster, StarRocksClusterStatus};
use crate::resources::FIELD_MANAGER;

/// Annotation marking the cluster-wide default StorageClass
pub const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Namespaced, typed Kubernetes object the client can operate on
pub trait NamespacedObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> NamespacedObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

/// How dependents are handled when an owner is deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are collected after the owner is gone
    Background,
    /// The owner disappears only after its dependents
    Foreground,
    /// Dependents survive and lose their owner reference
    Orphan,
}

impl From<Propagation> for PropagationPolicy {
    fn from(p: Propagation) -> Self {
        match p {
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Orphan => PropagationPolicy::Orphan,
        }
    }
}

/// Metadata changes on the cluster resource.
///
/// `None` annotation values remove the annotation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterMetadataPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, Option<String>>,
}

/// Operations the controllers need from the API server
#[async_trait]
pub trait KubeClient: Send + Sync + 'static {
    /// Fetch an object, `None` if it does not exist
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    /// List objects matching a label selector (`k=v,k=v`)
    async fn list<K: NamespacedObject>(&self, namespace: &str, label_selector: &str)
    -> Result<Vec<K>>;

    /// Create an object
    async fn create<K: NamespacedObject>(&self, namespace: &str, object: &K) -> Result<K>;

    /// Replace an object; its resourceVersion guards against lost updates
    async fn replace<K: NamespacedObject>(&self, namespace: &str, object: &K) -> Result<K>;

    /// Delete an object. Returns `false` if it was already gone.
    async fn delete<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<bool>;

    /// Fetch a StorageClass by name
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// The StorageClass marked as cluster default, if any
    async fn default_storage_class(&self) -> Result<Option<StorageClass>>;

    /// Replace the status of a StarRocksCluster through a merge patch
    /// that clears every field `status` leaves unset
    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StarRocksClusterStatus,
    ) -> Result<()>;

    /// Merge-patch finalizers and annotations of a StarRocksCluster
    async fn patch_cluster_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &ClusterMetadataPatch,
    ) -> Result<()>;
}

/// [`KubeClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeApiClient {
    client: Client,
}

impl KubeApiClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: NamespacedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeApiClient {
    async fn get<K: NamespacedObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn list<K: NamespacedObject>(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<K>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api::<K>(namespace).list(&params).await?.items)
    }

    async fn create<K: NamespacedObject>(&self, namespace: &str, object: &K) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .create(&PostParams::default(), object)
            .await?)
    }

    async fn replace<K: NamespacedObject>(&self, namespace: &str, object: &K) -> Result<K> {
        Ok(self
            .api::<K>(namespace)
            .replace(&object.name_any(), &PostParams::default(), object)
            .await?)
    }

    async fn delete<K: NamespacedObject>(
        &self,
        namespace: &str,
        name: &str,
        propagation: Propagation,
    ) -> Result<bool> {
        let params = DeleteParams {
            propagation_policy: Some(propagation.into()),
            ..Default::default()
        };
        match self.api::<K>(namespace).delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn default_storage_class(&self) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let classes = api.list(&ListParams::default()).await?;
        Ok(classes.items.into_iter().find(is_default_storage_class))
    }

    async fn patch_cluster_status(
        &self,
        namespace: &str,
        name: &str,
        status: &StarRocksClusterStatus,
    ) -> Result<()> {
        let api: Api<StarRocksCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status.to_merge_patch()? });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }

    async fn patch_cluster_metadata(
        &self,
        namespace: &str,
        name: &str,
        patch: &ClusterMetadataPatch,
    ) -> Result<()> {
        let api: Api<StarRocksCluster> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "metadata": patch });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Whether a StorageClass is annotated as the cluster default
pub fn is_default_storage_class(sc: &StorageClass) -> bool {
    sc.annotations()
        .get(DEFAULT_STORAGE_CLASS_ANNOTATION)
        .is_some_and(|v| v == "true")
}
