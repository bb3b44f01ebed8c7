use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::backend::state::BackendState;
use crate::cluster::{PodEvent, PodEventStream};
use crate::pod::{executor_exit_status, is_marked_for_deletion, is_running, node_name, pod_ip, pod_name};
use crate::scheduler::ExitReason;

/// Consumes the labelled pod event stream and records what it sees:
/// the IP index for running pods, and exit reasons for terminal pods.
/// It never notifies the driver scheduler itself; resolving a recorded
/// exit reason is the allocator's job.
pub(crate) struct ExecutorPodWatcher {
    state: Arc<BackendState>,
}

impl ExecutorPodWatcher {
    pub(crate) fn new(state: Arc<BackendState>) -> Self {
        Self { state }
    }

    pub(crate) async fn run(self, mut events: PodEventStream, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.next() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("the pod event stream has ended");
                        break;
                    }
                },
            }
        }
        debug!("the executor pod watcher has stopped");
    }

    pub(crate) fn handle(&self, event: PodEvent) {
        match event {
            PodEvent::Modified(pod) => {
                if is_marked_for_deletion(&pod) {
                    if let Some(ip) = pod_ip(&pod) {
                        self.state.remove_pod_by_ip(ip);
                    }
                } else if is_running(&pod) {
                    if let Some(ip) = pod_ip(&pod).map(str::to_string) {
                        info!(
                            "executor pod {} is running at {} with IP {ip}",
                            pod_name(&pod),
                            node_name(&pod).unwrap_or("<unknown>")
                        );
                        self.state.upsert_pod_by_ip(&ip, pod);
                    }
                }
            }
            PodEvent::Deleted(pod) => self.record_terminal(&pod, false),
            PodEvent::Errored(pod) => self.record_terminal(&pod, true),
        }
    }

    fn record_terminal(&self, pod: &Pod, errored: bool) {
        if let Some(ip) = pod_ip(pod) {
            self.state.remove_pod_by_ip(ip);
        }
        let reason = if errored {
            self.errored_exit_reason(pod)
        } else {
            self.deleted_exit_reason(pod)
        };
        debug!(
            "recording exit reason for pod {}: {}",
            pod_name(pod),
            reason.message
        );
        self.state.put_known_exit_reason(pod_name(pod), reason);
    }

    fn errored_exit_reason(&self, pod: &Pod) -> ExitReason {
        let exit_code = executor_exit_status(pod);
        if self.is_pod_released(pod) {
            // The container was terminated by the backend itself.
            ExitReason {
                exit_code,
                caused_by_app: false,
                message: format!(
                    "Container in pod {} exited from explicit termination request.",
                    pod_name(pod)
                ),
            }
        } else {
            ExitReason {
                exit_code,
                caused_by_app: true,
                message: format!(
                    "Pod {}'s executor container exited with exit status code {exit_code}.",
                    pod_name(pod)
                ),
            }
        }
    }

    fn deleted_exit_reason(&self, pod: &Pod) -> ExitReason {
        let message = if self.is_pod_released(pod) {
            format!(
                "Container in pod {} exited from explicit termination request.",
                pod_name(pod)
            )
        } else {
            format!("Pod {} deleted or lost.", pod_name(pod))
        };
        ExitReason {
            exit_code: executor_exit_status(pod),
            caused_by_app: false,
            message,
        }
    }

    /// Whether the pod has already been dropped from the executor indexes,
    /// which happens when the backend killed its executor on purpose.
    fn is_pod_released(&self, pod: &Pod) -> bool {
        !self.state.contains_pod_name(pod_name(pod))
    }
}
