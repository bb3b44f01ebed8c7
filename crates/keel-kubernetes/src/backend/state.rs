use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::core::v1::Pod;
use log::warn;

use crate::error::{BackendError, BackendResult};
use crate::id::{AtomicIdGenerator, ExecutorId};
use crate::pod::pod_name;
use crate::scheduler::ExitReason;

/// The authoritative executor bookkeeping.
///
/// Three flows mutate overlapping entries: the allocator, the pod watcher,
/// and the disconnect/kill callers. All maps live behind one mutex so that
/// every cross-map update is atomic; the cost of contention is negligible
/// at the seconds-scale event rate, while a torn pair of indexes would be
/// a correctness bug. Cluster calls are never made while holding the lock.
pub struct BackendState {
    indexes: Mutex<Indexes>,
    total_expected: AtomicUsize,
    executor_ids: AtomicIdGenerator<ExecutorId>,
}

#[derive(Default)]
struct Indexes {
    /// Executors with a live pod, keyed by executor id.
    executors_to_pods: HashMap<ExecutorId, Pod>,
    /// The inverse of `executors_to_pods`, keyed by pod name.
    pod_names_to_executors: HashMap<String, ExecutorId>,
    /// Pods that reached the running phase, keyed by pod IP.
    pods_by_ip: HashMap<String, Pod>,
    /// Exit reasons recorded by the watcher, keyed by pod name,
    /// awaiting consumption by the allocator.
    known_exit_reasons: HashMap<String, ExitReason>,
    /// Executors whose removal awaits exit-reason resolution.
    pending_removal: HashMap<ExecutorId, Pod>,
    /// The number of allocation rounds that looked for an exit reason
    /// of a pending-removal executor without finding one.
    reason_check_counts: HashMap<ExecutorId, usize>,
}

impl BackendState {
    pub fn new() -> Self {
        Self {
            indexes: Mutex::new(Indexes::default()),
            total_expected: AtomicUsize::new(0),
            executor_ids: AtomicIdGenerator::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        self.indexes.lock().expect("poisoned")
    }

    pub fn next_executor_id(&self) -> BackendResult<ExecutorId> {
        self.executor_ids.next()
    }

    pub fn total_expected(&self) -> usize {
        self.total_expected.load(Ordering::SeqCst)
    }

    pub fn set_total_expected(&self, total: usize) {
        self.total_expected.store(total, Ordering::SeqCst);
    }

    pub fn running_executor_count(&self) -> usize {
        self.lock().executors_to_pods.len()
    }

    /// Record a freshly allocated executor in both indexes.
    /// The executor id must not be in use.
    pub fn insert_allocated(&self, id: ExecutorId, pod: Pod) -> BackendResult<()> {
        let mut indexes = self.lock();
        if indexes.executors_to_pods.contains_key(&id) {
            return Err(BackendError::InternalError(format!(
                "executor {id} already has a pod"
            )));
        }
        indexes
            .pod_names_to_executors
            .insert(pod_name(&pod).to_string(), id);
        indexes.executors_to_pods.insert(id, pod);
        Ok(())
    }

    /// Drop an executor from both indexes and return its pod.
    pub fn remove_by_executor(&self, id: ExecutorId) -> Option<Pod> {
        let mut indexes = self.lock();
        let pod = indexes.executors_to_pods.remove(&id)?;
        indexes.pod_names_to_executors.remove(pod_name(&pod));
        Some(pod)
    }

    /// Schedule a live executor for removal.
    /// Returns false if the executor has no pod, in which case nothing
    /// is recorded.
    pub fn mark_pending_removal(&self, id: ExecutorId) -> bool {
        let mut indexes = self.lock();
        let Some(pod) = indexes.executors_to_pods.get(&id).cloned() else {
            return false;
        };
        indexes.pending_removal.insert(id, pod);
        true
    }

    /// Take the current set of executors awaiting removal.
    /// The allocator re-marks entries it cannot resolve yet.
    pub fn drain_pending_removals(&self) -> Vec<(ExecutorId, Pod)> {
        let mut indexes = self.lock();
        mem::take(&mut indexes.pending_removal).into_iter().collect()
    }

    /// Put back a pending removal whose exit reason is still unknown.
    /// An entry re-marked concurrently by a disconnect wins.
    pub fn restore_pending_removal(&self, id: ExecutorId, pod: Pod) {
        self.lock().pending_removal.entry(id).or_insert(pod);
    }

    /// The number of times the allocator has looked for this executor's
    /// exit reason, after counting the current attempt.
    pub fn increment_reason_check(&self, id: ExecutorId) -> usize {
        let mut indexes = self.lock();
        let count = indexes.reason_check_counts.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove every trace of an executor atomically: both indexes, its
    /// pending removal, its reason-check count, and any stale exit reason
    /// recorded for its pod.
    pub fn erase_executor(&self, id: ExecutorId, pod_name: &str) -> Option<Pod> {
        let mut indexes = self.lock();
        indexes.pending_removal.remove(&id);
        indexes.reason_check_counts.remove(&id);
        indexes.known_exit_reasons.remove(pod_name);
        indexes.pod_names_to_executors.remove(pod_name);
        indexes.executors_to_pods.remove(&id)
    }

    /// The kill path: drop the given executors from both indexes, enqueue
    /// them for exit-reason resolution, and return their pods so that the
    /// caller can delete them from the cluster outside the lock.
    pub fn remove_for_kill(&self, ids: &[ExecutorId]) -> Vec<Pod> {
        let mut indexes = self.lock();
        let mut pods = vec![];
        for &id in ids {
            let Some(pod) = indexes.executors_to_pods.remove(&id) else {
                warn!("cannot kill unknown executor {id}");
                continue;
            };
            indexes.pod_names_to_executors.remove(pod_name(&pod));
            indexes.pending_removal.insert(id, pod.clone());
            pods.push(pod);
        }
        pods
    }

    pub fn take_known_exit_reason(&self, pod_name: &str) -> Option<ExitReason> {
        self.lock().known_exit_reasons.remove(pod_name)
    }

    /// Record an exit reason for a pod. The last writer wins.
    pub fn put_known_exit_reason(&self, pod_name: &str, reason: ExitReason) {
        self.lock()
            .known_exit_reasons
            .insert(pod_name.to_string(), reason);
    }

    pub fn upsert_pod_by_ip(&self, ip: &str, pod: Pod) {
        self.lock().pods_by_ip.insert(ip.to_string(), pod);
    }

    pub fn remove_pod_by_ip(&self, ip: &str) {
        self.lock().pods_by_ip.remove(ip);
    }

    pub fn pod_by_ip(&self, ip: &str) -> Option<Pod> {
        self.lock().pods_by_ip.get(ip).cloned()
    }

    pub fn pods_by_ip_snapshot(&self) -> Vec<Pod> {
        self.lock().pods_by_ip.values().cloned().collect()
    }

    /// Whether the pod still belongs to a live executor.
    pub fn contains_pod_name(&self, pod_name: &str) -> bool {
        self.lock().pod_names_to_executors.contains_key(pod_name)
    }

    /// The shutdown path: clear both indexes and the IP index, returning
    /// the pods that were still owned by live executors.
    pub fn drain_all_executors(&self) -> Vec<Pod> {
        let mut indexes = self.lock();
        indexes.pod_names_to_executors.clear();
        indexes.pods_by_ip.clear();
        mem::take(&mut indexes.executors_to_pods)
            .into_values()
            .collect()
    }
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_indexes_stay_inverse() {
        let state = BackendState::new();
        let id = state.next_executor_id().unwrap();
        let pod = testing::executor_pod(id);
        state.insert_allocated(id, pod.clone()).unwrap();
        assert_eq!(state.running_executor_count(), 1);
        assert!(state.contains_pod_name(pod_name(&pod)));

        let removed = state.remove_by_executor(id).unwrap();
        assert_eq!(pod_name(&removed), pod_name(&pod));
        assert_eq!(state.running_executor_count(), 0);
        assert!(!state.contains_pod_name(pod_name(&pod)));
    }

    #[test]
    fn test_duplicate_allocation_is_rejected() {
        let state = BackendState::new();
        let id = state.next_executor_id().unwrap();
        state.insert_allocated(id, testing::executor_pod(id)).unwrap();
        assert!(state.insert_allocated(id, testing::executor_pod(id)).is_err());
    }

    #[test]
    fn test_pending_removal_requires_live_executor() {
        let state = BackendState::new();
        let id = state.next_executor_id().unwrap();
        assert!(!state.mark_pending_removal(id));

        state.insert_allocated(id, testing::executor_pod(id)).unwrap();
        assert!(state.mark_pending_removal(id));
        let pending = state.drain_pending_removals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, id);
        assert!(state.drain_pending_removals().is_empty());
    }

    #[test]
    fn test_exit_reasons_are_consumed_once() {
        let state = BackendState::new();
        let reason = ExitReason {
            exit_code: 1,
            caused_by_app: true,
            message: "exited".to_string(),
        };
        state.put_known_exit_reason("exec-1", reason.clone());
        assert_eq!(state.take_known_exit_reason("exec-1"), Some(reason));
        assert_eq!(state.take_known_exit_reason("exec-1"), None);
    }

    #[test]
    fn test_erase_executor_clears_every_map() {
        let state = BackendState::new();
        let id = state.next_executor_id().unwrap();
        let pod = testing::executor_pod(id);
        let name = pod_name(&pod).to_string();
        state.insert_allocated(id, pod).unwrap();
        state.mark_pending_removal(id);
        state.increment_reason_check(id);
        state.put_known_exit_reason(
            &name,
            ExitReason {
                exit_code: 0,
                caused_by_app: false,
                message: "stale".to_string(),
            },
        );

        assert!(state.erase_executor(id, &name).is_some());
        assert_eq!(state.running_executor_count(), 0);
        assert!(!state.contains_pod_name(&name));
        assert!(state.drain_pending_removals().is_empty());
        assert_eq!(state.take_known_exit_reason(&name), None);
        // A fresh count starts over after the erase.
        assert_eq!(state.increment_reason_check(id), 1);
    }

    #[test]
    fn test_kill_path_moves_executors_to_pending() {
        let state = BackendState::new();
        let known = state.next_executor_id().unwrap();
        let unknown = state.next_executor_id().unwrap();
        state
            .insert_allocated(known, testing::executor_pod(known))
            .unwrap();

        let pods = state.remove_for_kill(&[known, unknown]);
        assert_eq!(pods.len(), 1);
        assert_eq!(state.running_executor_count(), 0);
        let pending = state.drain_pending_removals();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, known);
    }

    #[test]
    fn test_pods_by_ip() {
        let state = BackendState::new();
        let pod = testing::running_pod("exec-1", "10.0.0.1", "node-a");
        state.upsert_pod_by_ip("10.0.0.1", pod);
        assert!(state.pod_by_ip("10.0.0.1").is_some());
        assert_eq!(state.pods_by_ip_snapshot().len(), 1);
        state.remove_pod_by_ip("10.0.0.1");
        assert!(state.pod_by_ip("10.0.0.1").is_none());
    }
}
