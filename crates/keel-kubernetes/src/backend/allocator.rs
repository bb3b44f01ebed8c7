use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::backend::state::BackendState;
use crate::cluster::ClusterClient;
use crate::options::ExecutorBackendOptions;
use crate::pod::{host_ip, node_name, pod_name};
use crate::pod_factory::ExecutorPodFactory;
use crate::scheduler::{DriverScheduler, ExecutorLossReason};

/// The number of allocation rounds that may look for the exit reason of a
/// disconnected executor before it is reported as lost for unknown reasons.
pub(crate) const MAX_REASON_CHECKS: usize = 10;

/// Reconciles the set of executor pods toward the expected total.
///
/// Each round first resolves executors awaiting removal, then creates up to
/// one batch of new pods to close the gap between the expected total and
/// the number of live executors. The allocator is the only component that
/// reports executor loss to the driver scheduler, so each executor is
/// reported at most once.
pub(crate) struct ExecutorAllocator {
    options: Arc<ExecutorBackendOptions>,
    state: Arc<BackendState>,
    scheduler: Arc<dyn DriverScheduler>,
    cluster: Arc<dyn ClusterClient>,
    pod_factory: Arc<dyn ExecutorPodFactory>,
    driver_pod: Pod,
}

impl ExecutorAllocator {
    pub(crate) fn new(
        options: Arc<ExecutorBackendOptions>,
        state: Arc<BackendState>,
        scheduler: Arc<dyn DriverScheduler>,
        cluster: Arc<dyn ClusterClient>,
        pod_factory: Arc<dyn ExecutorPodFactory>,
        driver_pod: Pod,
    ) -> Self {
        Self {
            options,
            state,
            scheduler,
            cluster,
            pod_factory,
            driver_pod,
        }
    }

    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.options.allocation_batch_delay);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        debug!("the executor allocator has stopped");
    }

    /// One allocation round. Removal resolution always runs before the
    /// creation phase so that a round that is simultaneously over the
    /// expected total and over the live count shrinks before it grows.
    pub(crate) async fn tick(&self) {
        self.reconcile_disconnections().await;
        self.scale_to_target().await;
    }

    async fn reconcile_disconnections(&self) {
        for (id, pod) in self.state.drain_pending_removals() {
            let name = pod_name(&pod).to_string();
            match self.state.take_known_exit_reason(&name) {
                Some(reason) => {
                    warn!(
                        "removing executor {id} with loss reason: {}",
                        reason.message
                    );
                    let caused_by_app = reason.caused_by_app;
                    self.scheduler
                        .remove_executor(id, ExecutorLossReason::Exited(reason))
                        .await;
                    self.state.erase_executor(id, &name);
                    if caused_by_app {
                        // The pod is retained so that the exited container
                        // can be inspected; it no longer consumes resources
                        // and the owner reference cleans it up eventually.
                        info!("executor {id} exited because of the application");
                    } else {
                        info!("executor {id} failed because of a framework error");
                        self.delete_pod(&name).await;
                    }
                }
                None => {
                    let checks = self.state.increment_reason_check(id);
                    if checks >= MAX_REASON_CHECKS {
                        warn!("giving up on finding an exit reason for executor {id}");
                        self.scheduler
                            .remove_executor(
                                id,
                                ExecutorLossReason::Lost {
                                    message: "Executor lost for unknown reasons.".to_string(),
                                },
                            )
                            .await;
                        self.state.erase_executor(id, &name);
                        self.delete_pod(&name).await;
                    } else {
                        self.state.restore_pending_removal(id, pod);
                    }
                }
            }
        }
    }

    async fn scale_to_target(&self) {
        let registered = self.scheduler.registered_executor_count();
        let running = self.state.running_executor_count();
        let expected = self.state.total_expected();
        if registered < running {
            debug!("waiting for pending executors to register before scaling");
            return;
        }
        if expected <= running {
            debug!("executor target of {expected} reached; not scaling up");
            return;
        }

        let node_locality = self.node_locality().await;
        let app_id = self.scheduler.application_id();
        let batch = (expected - running).min(self.options.allocation_batch_size);
        let mut planned = Vec::with_capacity(batch);
        for _ in 0..batch {
            let id = match self.state.next_executor_id() {
                Ok(id) => id,
                Err(e) => {
                    error!("failed to generate executor ids: {e}");
                    return;
                }
            };
            let pod = self.pod_factory.create(
                id,
                &app_id,
                &self.options.driver_url,
                &self.options.executor_env,
                &self.driver_pod,
                &node_locality,
            );
            planned.push((id, pod));
        }

        for (id, pod) in planned {
            match self.cluster.create_pod(pod).await {
                Ok(created) => {
                    info!("created pod {} for executor {id}", pod_name(&created));
                    if let Err(e) = self.state.insert_allocated(id, created) {
                        error!("failed to record allocated executor {id}: {e}");
                    }
                }
                Err(e) => {
                    // The id is abandoned; the next round allocates
                    // fresh ids for the remaining gap.
                    warn!("failed to create pod for executor {id}: {e}");
                }
            }
        }
    }

    /// The per-node pending task counts, with nodes that already run a
    /// live executor pod removed. Passed to the pod factory so that it
    /// may prefer under-represented nodes.
    async fn node_locality(&self) -> HashMap<String, usize> {
        let mut counts = self.scheduler.host_to_local_task_count();
        if counts.is_empty() {
            return counts;
        }
        let pods = self.state.pods_by_ip_snapshot();
        // Reverse name resolution can block, so it runs off the runtime.
        let handle = tokio::task::spawn_blocking(move || {
            subtract_occupied_nodes(&mut counts, &pods);
            counts
        });
        match handle.await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("failed to compute the node locality snapshot: {e}");
                HashMap::new()
            }
        }
    }

    async fn delete_pod(&self, name: &str) {
        if let Err(e) = self.cluster.delete_pod(name).await {
            warn!("failed to delete pod {name}: {e}");
        }
    }
}

/// Remove each node occupied by one of the given pods, matching the node
/// name, the host IP, or the canonical hostname of the host IP. At most
/// one key is removed per pod.
fn subtract_occupied_nodes(counts: &mut HashMap<String, usize>, pods: &[Pod]) {
    for pod in pods {
        if node_name(pod).is_some_and(|node| counts.remove(node).is_some()) {
            continue;
        }
        let Some(ip) = host_ip(pod) else {
            continue;
        };
        if counts.remove(ip).is_some() {
            continue;
        }
        if let Some(host) = canonical_hostname(ip) {
            counts.remove(&host);
        }
    }
}

fn canonical_hostname(ip: &str) -> Option<String> {
    let addr: IpAddr = ip.parse().ok()?;
    dns_lookup::lookup_addr(&addr).ok()
}
