use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::debug;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::{CancelReason, JobKey, JobState};

#[derive(Debug)]
struct HandleState {
    phase: JobState,
    cancel_reason: Option<CancelReason>,
    last_progress: Instant,
}

/// Control handle of one active job.
///
/// Cancellation is a one-way latch: the first reason wins, and once the job
/// has entered `Committing` it can no longer be cancelled.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    key: JobKey,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    finished: CancellationToken,
    state: Mutex<HandleState>,
}

impl JobHandle {
    pub fn new(id: Uuid, key: JobKey) -> Self {
        JobHandle {
            id,
            key,
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
            state: Mutex::new(HandleState {
                phase: JobState::Queued,
                cancel_reason: None,
                last_progress: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> JobState {
        self.lock().phase
    }

    pub(crate) fn set_state(&self, phase: JobState) {
        self.lock().phase = phase;
    }

    /// Enter `Running` and restart the stall clock
    pub(crate) fn mark_running(&self) {
        let mut state = self.lock();
        state.phase = JobState::Running;
        state.last_progress = Instant::now();
    }

    /// Request termination. Returns false if the job is already committing or finished.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut state = self.lock();
        if state.phase == JobState::Committing || state.phase.is_terminal() {
            return false;
        }
        if state.cancel_reason.is_none() {
            debug!("Job {}: cancellation requested ({})", self.id, reason);
            state.cancel_reason = Some(reason);
        }
        drop(state);
        self.cancel.cancel();
        true
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.lock().cancel_reason
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `Running -> Committing`, refused once termination has been requested
    pub(crate) fn begin_commit(&self) -> Result<(), CancelReason> {
        let mut state = self.lock();
        if let Some(reason) = state.cancel_reason {
            return Err(reason);
        }
        state.phase = JobState::Committing;
        Ok(())
    }

    pub(crate) fn record_progress(&self) {
        self.lock().last_progress = Instant::now();
    }

    /// Time since the last forward progress (or since the engine started)
    pub fn idle_for(&self) -> Duration {
        self.lock().last_progress.elapsed()
    }

    /// Cancel the job and wait until its teardown has completed
    pub async fn terminate(&self, reason: CancelReason) {
        self.cancel(reason);
        self.finished.cancelled().await;
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }
}

/// Snapshot entry of [`JobRegistry::snapshot`]
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub key: JobKey,
    pub id: Uuid,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
}

/// Map from input key to the handle of its single active job
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobKey, Arc<JobHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<JobHandle>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Swap in `handle` for `key`, returning the handle it replaced.
    /// The caller must terminate the returned handle before proceeding.
    pub fn register(&self, key: JobKey, handle: Arc<JobHandle>) -> Option<Arc<JobHandle>> {
        self.lock().insert(key, handle)
    }

    /// Remove the entry for `key` if it still belongs to job `id`; no-op otherwise
    pub fn remove(&self, key: &JobKey, id: Uuid) -> Option<Arc<JobHandle>> {
        let mut jobs = self.lock();
        if jobs.get(key).map(|h| h.id() == id).unwrap_or(false) {
            jobs.remove(key)
        } else {
            None
        }
    }

    pub fn lookup(&self, key: &JobKey) -> Option<Arc<JobHandle>> {
        self.lock().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<ActiveJob> {
        let mut active: Vec<ActiveJob> = self
            .lock()
            .iter()
            .map(|(key, handle)| ActiveJob {
                key: key.clone(),
                id: handle.id(),
                state: handle.state(),
                started_at: handle.started_at(),
            })
            .collect();
        active.sort_by(|a, b| a.key.cmp(&b.key));
        active
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(dir: &tempfile::TempDir, name: &str) -> JobKey {
        let path = dir.path().join(name);
        std::fs::write(&path, b"x").unwrap();
        JobKey::for_input(&path).unwrap()
    }

    fn handle(key: &JobKey) -> Arc<JobHandle> {
        Arc::new(JobHandle::new(Uuid::new_v4(), key.clone()))
    }

    #[test]
    fn test_register_returns_previous() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new();
        let k = key(&dir, "a.mkv");
        let first = handle(&k);
        let second = handle(&k);

        assert!(registry.register(k.clone(), first.clone()).is_none());
        let previous = registry.register(k.clone(), second.clone()).unwrap();
        assert_eq!(previous.id(), first.id());
        assert_eq!(registry.lookup(&k).unwrap().id(), second.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent_and_id_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new();
        let k = key(&dir, "a.mkv");
        let old = handle(&k);
        let new = handle(&k);
        registry.register(k.clone(), old.clone());
        registry.register(k.clone(), new.clone());

        // The superseded job reporting its own terminal state must not evict its successor
        assert!(registry.remove(&k, old.id()).is_none());
        assert!(registry.lookup(&k).is_some());

        assert!(registry.remove(&k, new.id()).is_some());
        assert!(registry.remove(&k, new.id()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_independent_registries() {
        let dir = tempfile::tempdir().unwrap();
        let a = JobRegistry::new();
        let b = JobRegistry::new();
        let k = key(&dir, "a.mkv");
        a.register(k.clone(), handle(&k));
        assert!(b.lookup(&k).is_none());
    }

    #[test]
    fn test_cancel_latches_first_reason() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle(&key(&dir, "a.mkv"));
        h.mark_running();
        assert!(h.cancel(CancelReason::Requested));
        assert!(h.cancel(CancelReason::Superseded));
        assert_eq!(h.cancel_reason(), Some(CancelReason::Requested));
        assert!(h.cancellation().is_cancelled());
        assert_eq!(h.begin_commit(), Err(CancelReason::Requested));
    }

    #[test]
    fn test_no_cancel_after_commit_started() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle(&key(&dir, "a.mkv"));
        h.mark_running();
        assert!(h.begin_commit().is_ok());
        assert!(!h.cancel(CancelReason::Requested));
        assert_eq!(h.cancel_reason(), None);
        assert!(!h.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_terminate_waits_for_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let h = handle(&key(&dir, "a.mkv"));
        h.mark_running();

        let worker = h.clone();
        let teardown = tokio::spawn(async move {
            worker.cancellation().cancelled().await;
            worker.set_state(JobState::Cancelled);
            worker.mark_finished();
        });

        h.terminate(CancelReason::Superseded).await;
        assert!(h.is_finished());
        assert_eq!(h.state(), JobState::Cancelled);
        teardown.await.unwrap();
    }

    proptest! {
        #[test]
        fn test_at_most_one_handle_per_key(ops in prop::collection::vec((0usize..3, prop::bool::ANY), 1..40)) {
            let dir = tempfile::tempdir().unwrap();
            let keys: Vec<JobKey> = (0..3).map(|i| key(&dir, &format!("{}.mkv", i))).collect();
            let registry = JobRegistry::new();
            let mut current: HashMap<usize, Uuid> = HashMap::new();

            for (k, register) in ops {
                if register {
                    let h = handle(&keys[k]);
                    let previous = registry.register(keys[k].clone(), h.clone());
                    prop_assert_eq!(previous.map(|p| p.id()), current.insert(k, h.id()));
                } else if let Some(id) = current.remove(&k) {
                    prop_assert!(registry.remove(&keys[k], id).is_some());
                }
            }

            prop_assert_eq!(registry.len(), current.len());
            for (k, id) in current {
                prop_assert_eq!(registry.lookup(&keys[k]).map(|h| h.id()), Some(id));
            }
        }
    }
}
