mod kubernetes;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;

use crate::error::BackendResult;

pub use kubernetes::KubeClusterClient;

/// A pod lifecycle event delivered by the cluster watch.
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// The pod changed. This includes the initial listing replay
    /// after the watch is established or re-established.
    Modified(Pod),
    /// The pod was deleted from the cluster.
    Deleted(Pod),
    /// The pod reached a failed phase.
    Errored(Pod),
}

pub type PodEventStream = BoxStream<'static, PodEvent>;

/// Access to the pods of the cluster namespace that executors run in.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// Submit a pod for creation and return the accepted pod.
    async fn create_pod(&self, pod: Pod) -> BackendResult<Pod>;

    async fn delete_pod(&self, name: &str) -> BackendResult<()>;

    /// Delete a set of pods on a best-effort basis.
    async fn delete_pods(&self, names: Vec<String>) -> BackendResult<()>;

    async fn get_pod(&self, name: &str) -> BackendResult<Pod>;

    async fn list_pods(&self, label_key: &str, label_value: &str) -> BackendResult<Vec<Pod>>;

    /// Open a stream of events for all pods carrying the given label.
    /// The stream re-establishes the underlying watch on transient errors
    /// and ends only when the client is shut down.
    async fn watch_pods(&self, label_key: &str, label_value: &str)
        -> BackendResult<PodEventStream>;

    /// Release any resources held by the client.
    async fn close(&self) {}
}
