use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::cluster::{ClusterClient, PodEventStream};
use crate::error::{BackendError, BackendResult};
use crate::id::ExecutorId;
use crate::options::ExecutorBackendOptions;
use crate::pod_factory::ExecutorPodFactory;
use crate::scheduler::{DriverScheduler, ExecutorLossReason};

pub(crate) fn options() -> ExecutorBackendOptions {
    ExecutorBackendOptions {
        namespace: "default".to_string(),
        driver_pod_name: "keel-driver".to_string(),
        driver_url: "keel://127.0.0.1:7077".to_string(),
        image: "keel:latest".to_string(),
        image_pull_policy: "IfNotPresent".to_string(),
        executor_pod_name_prefix: None,
        allocation_batch_size: 5,
        allocation_batch_delay: Duration::from_secs(1),
        min_registered_ratio: 0.8,
        initial_executors: 0,
        dynamic_allocation_enabled: false,
        executor_env: vec![],
    }
}

pub(crate) fn driver_pod() -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some("keel-driver".to_string());
    pod.metadata.uid = Some("driver-uid".to_string());
    pod
}

/// A minimal pod for an allocated executor, named like the pods produced
/// by [`MockFactory`].
pub(crate) fn executor_pod(id: ExecutorId) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(format!("exec-{id}"));
    pod
}

pub(crate) fn running_pod(name: &str, ip: &str, node: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.spec = Some(PodSpec {
        node_name: Some(node.to_string()),
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        pod_ip: Some(ip.to_string()),
        ..Default::default()
    });
    pod
}

pub(crate) fn running_pod_with_host(name: &str, ip: &str, host_ip: &str) -> Pod {
    let mut pod = running_pod(name, ip, "");
    pod.spec.get_or_insert_default().node_name = None;
    pod.status.get_or_insert_default().host_ip = Some(host_ip.to_string());
    pod
}

pub(crate) fn terminated_pod(name: &str, exit_code: i32) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(name.to_string());
    pod.status = Some(PodStatus {
        phase: Some("Failed".to_string()),
        container_statuses: Some(vec![ContainerStatus {
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    pod
}

pub(crate) fn mark_for_deletion(mut pod: Pod) -> Pod {
    pod.metadata.deletion_timestamp = Some(Time(Default::default()));
    pod
}

pub(crate) struct MockScheduler {
    app_id: String,
    registered: AtomicUsize,
    disable_result: AtomicBool,
    stopped: AtomicBool,
    removed: Mutex<Vec<(ExecutorId, ExecutorLossReason)>>,
    addresses: Mutex<HashMap<String, ExecutorId>>,
    host_task_counts: Mutex<HashMap<String, usize>>,
}

impl MockScheduler {
    pub(crate) fn new(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            registered: AtomicUsize::new(0),
            disable_result: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            removed: Mutex::new(vec![]),
            addresses: Mutex::new(HashMap::new()),
            host_task_counts: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn set_registered(&self, count: usize) {
        self.registered.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_disable_result(&self, result: bool) {
        self.disable_result.store(result, Ordering::SeqCst);
    }

    pub(crate) fn set_address(&self, id: ExecutorId, address: &str) {
        self.addresses
            .lock()
            .unwrap()
            .insert(address.to_string(), id);
    }

    pub(crate) fn set_host_to_local_task_count(
        &self,
        counts: impl Into<HashMap<String, usize>>,
    ) {
        *self.host_task_counts.lock().unwrap() = counts.into();
    }

    pub(crate) fn removed_executors(&self) -> Vec<(ExecutorId, ExecutorLossReason)> {
        self.removed.lock().unwrap().clone()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverScheduler for MockScheduler {
    async fn start(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn application_id(&self) -> String {
        self.app_id.clone()
    }

    fn registered_executor_count(&self) -> usize {
        self.registered.load(Ordering::SeqCst)
    }

    async fn remove_executor(&self, id: ExecutorId, reason: ExecutorLossReason) {
        self.removed.lock().unwrap().push((id, reason));
    }

    fn disable_executor(&self, _id: ExecutorId) -> bool {
        self.disable_result.load(Ordering::SeqCst)
    }

    fn executor_for_address(&self, address: &str) -> Option<ExecutorId> {
        self.addresses.lock().unwrap().get(address).copied()
    }

    fn host_to_local_task_count(&self) -> HashMap<String, usize> {
        self.host_task_counts.lock().unwrap().clone()
    }
}

pub(crate) struct MockCluster {
    created: Mutex<Vec<Pod>>,
    deleted: Mutex<Vec<String>>,
    fail_next_create: AtomicBool,
}

impl MockCluster {
    pub(crate) fn new() -> Self {
        Self {
            created: Mutex::new(vec![]),
            deleted: Mutex::new(vec![]),
            fail_next_create: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub(crate) fn created_pod_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|pod| crate::pod::pod_name(pod).to_string())
            .collect()
    }

    pub(crate) fn deleted_pod_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterClient for MockCluster {
    async fn create_pod(&self, pod: Pod) -> BackendResult<Pod> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(BackendError::InternalError(
                "injected pod creation failure".to_string(),
            ));
        }
        self.created.lock().unwrap().push(pod.clone());
        Ok(pod)
    }

    async fn delete_pod(&self, name: &str) -> BackendResult<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn delete_pods(&self, names: Vec<String>) -> BackendResult<()> {
        self.deleted.lock().unwrap().extend(names);
        Ok(())
    }

    async fn get_pod(&self, name: &str) -> BackendResult<Pod> {
        if name == "keel-driver" {
            Ok(driver_pod())
        } else {
            Err(BackendError::InternalError(format!(
                "pod {name} not found"
            )))
        }
    }

    async fn list_pods(&self, _label_key: &str, _label_value: &str) -> BackendResult<Vec<Pod>> {
        Ok(self.created.lock().unwrap().clone())
    }

    async fn watch_pods(
        &self,
        _label_key: &str,
        _label_value: &str,
    ) -> BackendResult<PodEventStream> {
        Ok(Box::pin(futures::stream::pending()))
    }
}

/// A pod factory that produces minimal pods named `exec-<id>` and records
/// the node-locality snapshot passed to each call.
pub(crate) struct MockFactory {
    localities: Mutex<Vec<HashMap<String, usize>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self {
            localities: Mutex::new(vec![]),
        }
    }

    pub(crate) fn node_localities(&self) -> Vec<HashMap<String, usize>> {
        self.localities.lock().unwrap().clone()
    }
}

impl ExecutorPodFactory for MockFactory {
    fn create(
        &self,
        executor_id: ExecutorId,
        _app_id: &str,
        _driver_url: &str,
        _env_overrides: &[(String, String)],
        _owner_pod: &Pod,
        node_locality: &HashMap<String, usize>,
    ) -> Pod {
        self.localities.lock().unwrap().push(node_locality.clone());
        executor_pod(executor_id)
    }
}
