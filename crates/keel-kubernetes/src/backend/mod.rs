mod allocator;
mod state;
mod watcher;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::allocator::ExecutorAllocator;
use crate::backend::state::BackendState;
use crate::backend::watcher::ExecutorPodWatcher;
use crate::cluster::ClusterClient;
use crate::error::{BackendError, BackendResult};
use crate::id::ExecutorId;
use crate::options::ExecutorBackendOptions;
use crate::pod::pod_name;
use crate::pod_factory::{ExecutorPodFactory, APP_ID_LABEL};
use crate::scheduler::DriverScheduler;

/// The Kubernetes scheduler backend.
///
/// Runs the application's executors as pods, reconciling the set of live
/// pods toward the total requested by the driver scheduler, and reporting
/// every executor loss back to it exactly once with an attributed reason.
pub struct KubernetesExecutorBackend {
    options: Arc<ExecutorBackendOptions>,
    scheduler: Arc<dyn DriverScheduler>,
    cluster: Arc<dyn ClusterClient>,
    pod_factory: Arc<dyn ExecutorPodFactory>,
    state: Arc<BackendState>,
    lifecycle: Mutex<Lifecycle>,
}

enum Lifecycle {
    Created,
    Started {
        allocator_shutdown: CancellationToken,
        allocator: JoinHandle<()>,
        watch_shutdown: CancellationToken,
        watcher: JoinHandle<()>,
    },
    Stopped,
}

impl KubernetesExecutorBackend {
    pub fn new(
        options: ExecutorBackendOptions,
        scheduler: Arc<dyn DriverScheduler>,
        cluster: Arc<dyn ClusterClient>,
        pod_factory: Arc<dyn ExecutorPodFactory>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            scheduler,
            cluster,
            pod_factory,
            state: Arc::new(BackendState::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub async fn start(&self) -> BackendResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Err(BackendError::InternalError(
                "the executor backend has already been started".to_string(),
            ));
        }
        self.scheduler.start().await?;

        let driver_pod = self
            .cluster
            .get_pod(&self.options.driver_pod_name)
            .await?;
        if driver_pod.metadata.uid.is_none() {
            return Err(BackendError::InvalidArgument(format!(
                "driver pod {} has no UID",
                self.options.driver_pod_name
            )));
        }

        let app_id = self.scheduler.application_id();
        let events = self.cluster.watch_pods(APP_ID_LABEL, &app_id).await?;
        let watch_shutdown = CancellationToken::new();
        let watcher = tokio::spawn(
            ExecutorPodWatcher::new(self.state.clone()).run(events, watch_shutdown.clone()),
        );

        let allocator_shutdown = CancellationToken::new();
        let allocator = tokio::spawn(
            ExecutorAllocator::new(
                self.options.clone(),
                self.state.clone(),
                self.scheduler.clone(),
                self.cluster.clone(),
                self.pod_factory.clone(),
                driver_pod,
            )
            .run(allocator_shutdown.clone()),
        );

        if !self.options.dynamic_allocation_enabled {
            self.request_total_executors(self.options.initial_executors)
                .await?;
        }

        *lifecycle = Lifecycle::Started {
            allocator_shutdown,
            allocator,
            watch_shutdown,
            watcher,
        };
        info!("the Kubernetes executor backend has started for application {app_id}");
        Ok(())
    }

    /// Stop the backend on a best-effort basis.
    /// A second call, or a call before [`Self::start`], is a no-op.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Lifecycle::Started {
            allocator_shutdown,
            allocator,
            watch_shutdown,
            watcher,
        } = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        else {
            return;
        };

        // Stop allocating before anything else, and wait for the round
        // that may be in flight.
        allocator_shutdown.cancel();
        if let Err(e) = allocator.await {
            warn!("failed to join the executor allocator task: {e}");
        }

        // The scheduler sends shutdown messages to executors over RPC.
        self.scheduler.stop().await;

        let pods = self.state.drain_all_executors();
        if !pods.is_empty() {
            let names = pods
                .iter()
                .map(|pod| pod_name(pod).to_string())
                .collect::<Vec<_>>();
            debug!("deleting {} executor pods on shutdown", names.len());
            if let Err(e) = self.cluster.delete_pods(names).await {
                warn!("failed to delete executor pods on shutdown: {e}");
            }
        }

        watch_shutdown.cancel();
        if let Err(e) = watcher.await {
            warn!("failed to join the pod watcher task: {e}");
        }

        self.cluster.close().await;
        info!("the Kubernetes executor backend has stopped");
    }

    /// Set the total number of executors to reconcile toward.
    /// The request is recorded synchronously and always succeeds; the
    /// allocator closes the gap over the following rounds.
    pub async fn request_total_executors(&self, total: usize) -> BackendResult<bool> {
        debug!("setting the expected executor total to {total}");
        self.state.set_total_expected(total);
        Ok(true)
    }

    /// Remove the given executors and delete their pods.
    /// Unknown ids are logged and skipped. The call always succeeds; the
    /// loss of each executor is reported once its exit reason resolves.
    pub async fn kill_executors(&self, ids: Vec<ExecutorId>) -> BackendResult<bool> {
        let pods = self.state.remove_for_kill(&ids);
        if !pods.is_empty() {
            let names = pods
                .iter()
                .map(|pod| pod_name(pod).to_string())
                .collect::<Vec<_>>();
            if let Err(e) = self.cluster.delete_pods(names).await {
                warn!("failed to delete pods for killed executors: {e}");
            }
        }
        Ok(true)
    }

    /// The running executor pod with the given IP, if any.
    pub fn pod_by_ip(&self, ip: &str) -> Option<Pod> {
        self.state.pod_by_ip(ip)
    }

    /// Whether enough executors have registered for the application
    /// to start scheduling tasks.
    pub fn sufficient_resources_registered(&self) -> bool {
        self.scheduler.registered_executor_count() as f64
            >= self.options.initial_executors as f64 * self.options.min_registered_ratio
    }

    /// Invoked by the driver's RPC layer when it observes a disconnect.
    /// Disabling the executor gates the removal so that it is scheduled
    /// at most once; the allocator resolves it on its next round.
    pub fn executor_disconnected(&self, address: &str) {
        let Some(id) = self.scheduler.executor_for_address(address) else {
            debug!("ignoring disconnect from non-executor address {address}");
            return;
        };
        if self.scheduler.disable_executor(id) {
            if self.state.mark_pending_removal(id) {
                debug!("executor {id} is pending removal after disconnect");
            } else {
                warn!("disconnected executor {id} has no pod");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::PodEvent;
    use crate::scheduler::ExecutorLossReason;
    use crate::testing::{self, MockCluster, MockFactory, MockScheduler};

    struct Fixture {
        backend: KubernetesExecutorBackend,
        scheduler: Arc<MockScheduler>,
        cluster: Arc<MockCluster>,
    }

    fn fixture(options: ExecutorBackendOptions) -> Fixture {
        let scheduler = Arc::new(MockScheduler::new("app-1"));
        let cluster = Arc::new(MockCluster::new());
        let backend = KubernetesExecutorBackend::new(
            options,
            scheduler.clone(),
            cluster.clone(),
            Arc::new(MockFactory::new()),
        );
        Fixture {
            backend,
            scheduler,
            cluster,
        }
    }

    #[tokio::test]
    async fn test_request_total_always_succeeds() {
        let f = fixture(testing::options());
        assert!(f.backend.request_total_executors(7).await.unwrap());
        assert_eq!(f.backend.state.total_expected(), 7);
    }

    #[tokio::test]
    async fn test_kill_executors_deletes_pods_and_marks_pending() {
        let f = fixture(testing::options());
        let id = f.backend.state.next_executor_id().unwrap();
        f.backend
            .state
            .insert_allocated(id, testing::executor_pod(id))
            .unwrap();

        assert!(f.backend.kill_executors(vec![id]).await.unwrap());
        assert_eq!(f.cluster.deleted_pod_names(), vec!["exec-1"]);
        assert_eq!(f.backend.state.running_executor_count(), 0);
        let pending = f.backend.state.drain_pending_removals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, id);
    }

    #[tokio::test]
    async fn test_kill_unknown_executor_is_a_no_op() {
        let f = fixture(testing::options());
        assert!(f.backend.kill_executors(vec![42.into()]).await.unwrap());
        assert!(f.cluster.deleted_pod_names().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_gated_by_disable() {
        let f = fixture(testing::options());
        let id = f.backend.state.next_executor_id().unwrap();
        f.backend
            .state
            .insert_allocated(id, testing::executor_pod(id))
            .unwrap();
        f.scheduler.set_address(id, "10.0.0.1:4040");

        f.scheduler.set_disable_result(false);
        f.backend.executor_disconnected("10.0.0.1:4040");
        assert!(f.backend.state.drain_pending_removals().is_empty());

        f.scheduler.set_disable_result(true);
        f.backend.executor_disconnected("10.0.0.1:4040");
        let pending = f.backend.state.drain_pending_removals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, id);
    }

    #[tokio::test]
    async fn test_disconnect_from_unknown_address_is_ignored() {
        let f = fixture(testing::options());
        f.backend.executor_disconnected("10.9.9.9:4040");
        assert!(f.backend.state.drain_pending_removals().is_empty());
    }

    #[tokio::test]
    async fn test_sufficient_resources_registered_uses_the_ratio() {
        let mut options = testing::options();
        options.initial_executors = 5;
        options.min_registered_ratio = 0.8;
        let f = fixture(options);

        f.scheduler.set_registered(3);
        assert!(!f.backend.sufficient_resources_registered());
        f.scheduler.set_registered(4);
        assert!(f.backend.sufficient_resources_registered());
    }

    #[tokio::test]
    async fn test_kill_then_delete_event_resolves_on_the_next_round() {
        // Scale-down via kill: the watcher sees the pod deletion and the
        // allocator reports the loss as an explicit termination.
        let f = fixture(testing::options());
        let state = f.backend.state.clone();
        let id = state.next_executor_id().unwrap();
        let pod = testing::executor_pod(id);
        state.insert_allocated(id, pod.clone()).unwrap();

        f.backend.kill_executors(vec![id]).await.unwrap();

        let watcher = ExecutorPodWatcher::new(state.clone());
        watcher.handle(PodEvent::Deleted(testing::terminated_pod("exec-1", 0)));

        let allocator = ExecutorAllocator::new(
            f.backend.options.clone(),
            state.clone(),
            f.scheduler.clone(),
            f.cluster.clone(),
            Arc::new(MockFactory::new()),
            testing::driver_pod(),
        );
        allocator.tick().await;

        let removed = f.scheduler.removed_executors();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, id);
        assert!(matches!(
            &removed[0].1,
            ExecutorLossReason::Exited(reason)
                if !reason.caused_by_app && reason.message.contains("explicit termination")
        ));
        assert_eq!(state.running_executor_count(), 0);
    }

    #[tokio::test]
    async fn test_crashed_executor_is_reported_and_its_pod_retained() {
        // An executor container crashes: the watcher records an
        // application-caused reason, the disconnect marks the executor
        // for removal, and the next round reports the loss while leaving
        // the pod in the cluster for inspection.
        let f = fixture(testing::options());
        let state = f.backend.state.clone();
        let id = state.next_executor_id().unwrap();
        let pod = testing::terminated_pod("exec-1", 137);
        state.insert_allocated(id, pod.clone()).unwrap();
        f.scheduler.set_address(id, "10.0.0.1:4040");

        let watcher = ExecutorPodWatcher::new(state.clone());
        watcher.handle(PodEvent::Errored(pod));

        f.backend.executor_disconnected("10.0.0.1:4040");

        let allocator = ExecutorAllocator::new(
            f.backend.options.clone(),
            state.clone(),
            f.scheduler.clone(),
            f.cluster.clone(),
            Arc::new(MockFactory::new()),
            testing::driver_pod(),
        );
        allocator.tick().await;

        let removed = f.scheduler.removed_executors();
        assert_eq!(removed.len(), 1);
        assert!(matches!(
            &removed[0].1,
            ExecutorLossReason::Exited(reason)
                if reason.exit_code == 137 && reason.caused_by_app
        ));
        assert!(f.cluster.deleted_pod_names().is_empty());
        assert_eq!(state.running_executor_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_deletes_remaining_pods_once() {
        let f = fixture(testing::options());
        f.backend.start().await.unwrap();
        let id = f.backend.state.next_executor_id().unwrap();
        f.backend
            .state
            .insert_allocated(id, testing::executor_pod(id))
            .unwrap();

        f.backend.stop().await;
        assert!(f.scheduler.stopped());
        assert_eq!(f.cluster.deleted_pod_names(), vec!["exec-1"]);
        assert_eq!(f.backend.state.running_executor_count(), 0);

        // Stopping again is a no-op.
        f.backend.stop().await;
        assert_eq!(f.cluster.deleted_pod_names().len(), 1);
    }

    #[tokio::test]
    async fn test_start_requests_the_initial_total_without_dynamic_allocation() {
        let mut options = testing::options();
        options.initial_executors = 4;
        let f = fixture(options);
        f.backend.start().await.unwrap();
        assert_eq!(f.backend.state.total_expected(), 4);
        f.backend.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let f = fixture(testing::options());
        f.backend.start().await.unwrap();
        assert!(f.backend.start().await.is_err());
        f.backend.stop().await;
    }
}
