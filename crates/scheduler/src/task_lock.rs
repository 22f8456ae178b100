//! At most one in-flight action per task, with idempotent replay of successful results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use soulbrowser_core_types::{ActionId, BusError, TaskId};

use crate::metrics;

pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Value returned by [`TaskLock::run_exclusive`].
#[derive(Clone, Debug, PartialEq)]
pub struct LockOutcome<T> {
    /// True when served from the result cache without running anything.
    pub cached: bool,
    pub value: T,
}

type SharedRun<T> = Shared<BoxFuture<'static, Result<T, BusError>>>;

struct Inflight<T: Clone> {
    action_id: ActionId,
    run: SharedRun<T>,
}

struct CachedResult<T> {
    value: T,
    expires_at: Instant,
}

struct LockState<T: Clone> {
    inflight: Mutex<HashMap<TaskId, Inflight<T>>>,
    cache: DashMap<(TaskId, ActionId), CachedResult<T>>,
}

pub struct TaskLock<T: Clone> {
    state: Arc<LockState<T>>,
    default_ttl: Duration,
}

/// Clears the in-flight marker when the run finishes, panics included.
struct Release<T: Clone + Send + Sync + 'static> {
    state: Arc<LockState<T>>,
    task_id: TaskId,
    action_id: ActionId,
}

impl<T: Clone + Send + Sync + 'static> Drop for Release<T> {
    fn drop(&mut self) {
        let mut inflight = self.state.inflight.lock();
        if inflight
            .get(&self.task_id)
            .is_some_and(|entry| entry.action_id == self.action_id)
        {
            inflight.remove(&self.task_id);
        }
        debug!(target: "task-lock", task_id = %self.task_id, action_id = %self.action_id, "task lock released");
    }
}

impl<T> TaskLock<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            state: Arc::new(LockState {
                inflight: Mutex::new(HashMap::new()),
                cache: DashMap::new(),
            }),
            default_ttl,
        }
    }

    /// Run `work` as `action_id` of `task_id`.
    ///
    /// A fresh cached success is returned as is. A call for the action already in flight joins
    /// it. A call for a different action while the task is held fails `TASK_LOCKED` without
    /// waiting. Only successes are cached; the lock is released whatever the outcome, and the
    /// run completes even if every caller stops waiting.
    pub async fn run_exclusive<F, Fut>(
        &self,
        task_id: &TaskId,
        action_id: &ActionId,
        work: F,
        ttl: Option<Duration>,
    ) -> Result<LockOutcome<T>, BusError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BusError>> + Send + 'static,
    {
        let key = (task_id.clone(), action_id.clone());
        if let Some(hit) = self.cache_hit(&key) {
            return Ok(hit);
        }

        let run = {
            let mut inflight = self.state.inflight.lock();
            match inflight.get(task_id) {
                Some(entry) if &entry.action_id == action_id => {
                    metrics::record_lock_join();
                    debug!(target: "task-lock", %task_id, %action_id, "joining in-flight action");
                    entry.run.clone()
                }
                Some(entry) => {
                    metrics::record_lock_conflict();
                    warn!(
                        target: "task-lock",
                        %task_id,
                        %action_id,
                        locked_by = %entry.action_id,
                        "task is locked by another action"
                    );
                    return Err(BusError::TaskLocked {
                        task_id: task_id.clone(),
                        locked_by: entry.action_id.clone(),
                    });
                }
                None => {
                    // A run that just finished has cached its value before clearing the marker.
                    if let Some(hit) = self.cache_hit(&key) {
                        return Ok(hit);
                    }
                    let run = self.launch(key, work(), ttl.unwrap_or(self.default_ttl));
                    inflight.insert(
                        task_id.clone(),
                        Inflight {
                            action_id: action_id.clone(),
                            run: run.clone(),
                        },
                    );
                    run
                }
            }
        };

        run.await.map(|value| LockOutcome {
            cached: false,
            value,
        })
    }

    fn launch<Fut>(&self, key: (TaskId, ActionId), work: Fut, ttl: Duration) -> SharedRun<T>
    where
        Fut: Future<Output = Result<T, BusError>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            let _release = Release {
                state: Arc::clone(&state),
                task_id: key.0.clone(),
                action_id: key.1.clone(),
            };
            let result = work.await;
            if let Ok(value) = &result {
                state.cache.insert(
                    key,
                    CachedResult {
                        value: value.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
            }
            result
        });
        handle
            .map(|joined| {
                joined.unwrap_or_else(|err| Err(BusError::Internal(format!("action aborted: {err}"))))
            })
            .boxed()
            .shared()
    }

    fn cache_hit(&self, key: &(TaskId, ActionId)) -> Option<LockOutcome<T>> {
        let value = self.cached(key)?;
        metrics::record_lock_hit();
        debug!(target: "task-lock", task_id = %key.0, action_id = %key.1, "served cached result");
        Some(LockOutcome {
            cached: true,
            value,
        })
    }

    fn cached(&self, key: &(TaskId, ActionId)) -> Option<T> {
        let now = Instant::now();
        let hit = self.state.cache.get(key).and_then(|entry| {
            if entry.expires_at > now {
                Some(entry.value.clone())
            } else {
                None
            }
        });
        if hit.is_none() {
            self.state.cache.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        hit
    }

    pub fn locked_by(&self, task_id: &TaskId) -> Option<ActionId> {
        self.state
            .inflight
            .lock()
            .get(task_id)
            .map(|entry| entry.action_id.clone())
    }

    /// Drop expired cache entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.state.cache.len();
        self.state.cache.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.state.cache.len())
    }

    pub fn cached_len(&self) -> usize {
        self.state.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(task: &str, action: &str) -> (TaskId, ActionId) {
        (TaskId(task.into()), ActionId(action.into()))
    }

    #[tokio::test(start_paused = true)]
    async fn same_identity_runs_once_and_shares_the_result() {
        let lock: Arc<TaskLock<u32>> = Arc::new(TaskLock::new(DEFAULT_RESULT_TTL));
        let runs = Arc::new(AtomicUsize::new(0));
        let (task, action) = ids("t", "a");

        let call = |lock: Arc<TaskLock<u32>>, runs: Arc<AtomicUsize>| {
            let (task, action) = (task.clone(), action.clone());
            async move {
                lock.run_exclusive(
                    &task,
                    &action,
                    move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    },
                    None,
                )
                .await
            }
        };

        let (first, second) = tokio::join!(
            call(lock.clone(), runs.clone()),
            call(lock.clone(), runs.clone())
        );
        assert_eq!(first.unwrap().value, 42);
        assert_eq!(second.unwrap().value, 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let replay = call(lock.clone(), runs.clone()).await.unwrap();
        assert!(replay.cached);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_callers_never_run_the_same_action_twice() {
        for round in 0..2_000 {
            let lock: Arc<TaskLock<u32>> = Arc::new(TaskLock::new(DEFAULT_RESULT_TTL));
            let runs = Arc::new(AtomicUsize::new(0));
            let (task, action) = ids(&format!("t{round}"), "a");

            let callers: Vec<_> = (0..2)
                .map(|_| {
                    let (lock, runs) = (lock.clone(), runs.clone());
                    let (task, action) = (task.clone(), action.clone());
                    tokio::spawn(async move {
                        lock.run_exclusive(
                            &task,
                            &action,
                            move || async move {
                                runs.fetch_add(1, Ordering::SeqCst);
                                Ok(round)
                            },
                            None,
                        )
                        .await
                    })
                })
                .collect();
            for caller in callers {
                assert_eq!(caller.await.unwrap().unwrap().value, round);
            }
            assert_eq!(runs.load(Ordering::SeqCst), 1, "round {round} ran twice");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn different_action_on_busy_task_is_rejected() {
        let lock: Arc<TaskLock<u32>> = Arc::new(TaskLock::new(DEFAULT_RESULT_TTL));
        let (task, first) = ids("t", "a1");
        let second = ActionId("a2".into());

        let held = {
            let lock = lock.clone();
            let task = task.clone();
            tokio::spawn(async move {
                lock.run_exclusive(
                    &task,
                    &first,
                    || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(1)
                    },
                    None,
                )
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(lock.locked_by(&task), Some(ActionId("a1".into())));

        let err = lock
            .run_exclusive(&task, &second, || async { Ok(2) }, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TASK_LOCKED");

        assert_eq!(held.await.unwrap().unwrap().value, 1);
        assert!(lock.locked_by(&task).is_none());
        let after = lock
            .run_exclusive(&task, &second, || async { Ok(2) }, None)
            .await
            .unwrap();
        assert_eq!(after.value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_not_cached_and_release_the_lock() {
        let lock: TaskLock<u32> = TaskLock::new(DEFAULT_RESULT_TTL);
        let (task, action) = ids("t", "a");
        let err = lock
            .run_exclusive(&task, &action, || async { Err(BusError::remote("boom")) }, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REMOTE_ERROR");
        assert!(lock.locked_by(&task).is_none());

        let retry = lock
            .run_exclusive(&task, &action, || async { Ok(7) }, None)
            .await
            .unwrap();
        assert!(!retry.cached);
        assert_eq!(retry.value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_results_expire() {
        let lock: TaskLock<u32> = TaskLock::new(DEFAULT_RESULT_TTL);
        let (task, action) = ids("t", "a");
        lock.run_exclusive(&task, &action, || async { Ok(1) }, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let rerun = lock
            .run_exclusive(&task, &action, || async { Ok(2) }, None)
            .await
            .unwrap();
        assert!(!rerun.cached);
        assert_eq!(rerun.value, 2);
        assert_eq!(lock.purge_expired(), 0);
    }
}
