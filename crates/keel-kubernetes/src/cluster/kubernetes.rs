use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use log::{debug, warn};
use tokio::sync::OnceCell;

use crate::cluster::{ClusterClient, PodEvent, PodEventStream};
use crate::error::BackendResult;
use crate::pod::{phase, pod_name, FAILED_PHASE};

/// A [`ClusterClient`] backed by the Kubernetes API server.
/// The underlying client is created lazily on first use so that the
/// backend can be constructed outside a cluster (e.g. in tests).
pub struct KubeClusterClient {
    namespace: String,
    pods: OnceCell<Api<Pod>>,
}

impl KubeClusterClient {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pods: OnceCell::new(),
        }
    }

    async fn pods(&self) -> BackendResult<&Api<Pod>> {
        let pods = self
            .pods
            .get_or_try_init(|| async {
                kube::Client::try_default()
                    .await
                    .map(|client| Api::namespaced(client, &self.namespace))
            })
            .await?;
        Ok(pods)
    }
}

fn classify(pod: Pod) -> PodEvent {
    if phase(&pod) == Some(FAILED_PHASE) {
        PodEvent::Errored(pod)
    } else {
        PodEvent::Modified(pod)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_pod(&self, pod: Pod) -> BackendResult<Pod> {
        let created = self.pods().await?.create(&PostParams::default(), &pod).await?;
        Ok(created)
    }

    async fn delete_pod(&self, name: &str) -> BackendResult<()> {
        self.pods().await?.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_pods(&self, names: Vec<String>) -> BackendResult<()> {
        let pods = self.pods().await?;
        for name in names {
            if let Err(e) = pods.delete(&name, &DeleteParams::default()).await {
                warn!("failed to delete pod {name}: {e}");
            }
        }
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> BackendResult<Pod> {
        let pod = self.pods().await?.get(name).await?;
        Ok(pod)
    }

    async fn list_pods(&self, label_key: &str, label_value: &str) -> BackendResult<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("{label_key}={label_value}"));
        let pods = self.pods().await?.list(&params).await?;
        Ok(pods.items)
    }

    async fn watch_pods(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> BackendResult<PodEventStream> {
        let api = self.pods().await?.clone();
        let config = watcher::Config::default().labels(&format!("{label_key}={label_value}"));
        let stream = watcher(api, config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(pod)) | Ok(watcher::Event::InitApply(pod)) => {
                        Some(classify(pod))
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        debug!("pod {} was deleted from the cluster", pod_name(&pod));
                        Some(PodEvent::Deleted(pod))
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => {
                        // The watcher re-establishes the watch with backoff.
                        debug!("pod watch interrupted: {e}");
                        None
                    }
                }
            });
        Ok(stream.boxed())
    }

    async fn close(&self) {
        // The Kubernetes client releases its connections when dropped.
        debug!("closing the Kubernetes cluster client");
    }
}
