use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::BackendResult;
use crate::id::ExecutorId;

/// The exit code reported when the terminated container state carries none.
pub const UNKNOWN_EXIT_CODE: i32 = -1;
/// The exit code reported when the pod has no container status at all.
pub const DEFAULT_CONTAINER_FAILURE_EXIT_STATUS: i32 = -1;

/// The terminal outcome of an executor pod as observed from the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReason {
    pub exit_code: i32,
    /// Whether the exit is attributable to the application rather than
    /// to the framework (explicit kill, deletion, or loss).
    pub caused_by_app: bool,
    pub message: String,
}

/// The reason reported to the driver scheduler when an executor is removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorLossReason {
    /// The exit was observed through the pod status.
    Exited(ExitReason),
    /// No terminal pod event was seen for the executor.
    Lost { message: String },
}

impl ExecutorLossReason {
    pub fn message(&self) -> &str {
        match self {
            ExecutorLossReason::Exited(reason) => &reason.message,
            ExecutorLossReason::Lost { message } => message,
        }
    }
}

/// The coarse-grained scheduler in the driver that owns the per-executor
/// RPC connections. The backend reports executor lifecycle changes to it
/// and consults it for registration and task placement information.
#[async_trait]
pub trait DriverScheduler: Send + Sync + 'static {
    async fn start(&self) -> BackendResult<()>;

    /// Stop the scheduler on a best-effort basis.
    /// The scheduler is expected to send shutdown messages to all
    /// registered executors over RPC before returning.
    async fn stop(&self);

    fn application_id(&self) -> String;

    /// The number of executors that have completed RPC registration.
    fn registered_executor_count(&self) -> usize;

    /// Report the loss of an executor.
    /// The backend calls this at most once per executor id.
    async fn remove_executor(&self, id: ExecutorId, reason: ExecutorLossReason);

    /// Stop scheduling tasks on an executor that is about to be removed.
    /// Returns false if the executor was already disabled, in which case
    /// the backend must not schedule its removal a second time.
    fn disable_executor(&self, id: ExecutorId) -> bool;

    /// The executor registered from the given remote RPC address, if any.
    fn executor_for_address(&self, address: &str) -> Option<ExecutorId>;

    /// The number of pending tasks that prefer each cluster host
    /// for data locality.
    fn host_to_local_task_count(&self) -> HashMap<String, usize>;
}
