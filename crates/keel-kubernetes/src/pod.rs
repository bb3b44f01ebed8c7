use k8s_openapi::api::core::v1::Pod;

use crate::scheduler::{DEFAULT_CONTAINER_FAILURE_EXIT_STATUS, UNKNOWN_EXIT_CODE};

pub(crate) const RUNNING_PHASE: &str = "Running";
pub(crate) const FAILED_PHASE: &str = "Failed";

pub(crate) fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub(crate) fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

pub(crate) fn host_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.host_ip.as_deref()
}

pub(crate) fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

pub(crate) fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

pub(crate) fn is_running(pod: &Pod) -> bool {
    phase(pod) == Some(RUNNING_PHASE)
}

pub(crate) fn is_marked_for_deletion(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// The exit status of the executor container.
/// The first container is assumed to be the executor; exit-code attribution
/// is undefined when sidecar containers are present.
pub(crate) fn executor_exit_status(pod: &Pod) -> i32 {
    let status = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .and_then(|statuses| statuses.first());
    match status {
        Some(status) => status
            .state
            .as_ref()
            .and_then(|state| state.terminated.as_ref())
            .map(|terminated| terminated.exit_code)
            .unwrap_or(UNKNOWN_EXIT_CODE),
        None => DEFAULT_CONTAINER_FAILURE_EXIT_STATUS,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus};

    use super::*;
    use crate::testing;

    #[test]
    fn test_executor_exit_status() {
        let mut pod = testing::running_pod("exec-1", "10.0.0.1", "node-a");
        assert_eq!(executor_exit_status(&pod), DEFAULT_CONTAINER_FAILURE_EXIT_STATUS);

        let status = pod.status.get_or_insert_default();
        status.container_statuses = Some(vec![ContainerStatus {
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 137,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert_eq!(executor_exit_status(&pod), 137);

        let status = pod.status.get_or_insert_default();
        status.container_statuses = Some(vec![ContainerStatus::default()]);
        assert_eq!(executor_exit_status(&pod), UNKNOWN_EXIT_CODE);
    }
}
