//! Generic task-id-keyed polling.
//!
//! [`PollingEngine::start`] invokes the poll function immediately, then
//! on a fixed interval — no adaptive slowdown. Three ways out, all of
//! which delete the registration:
//!
//! - the poll resolves done → `on_success`, exactly once
//! - the consecutive-failure budget is exhausted → `on_error(Expired)`
//! - the wall-clock budget is exceeded → `on_error(TimedOut)`
//!
//! The registration record is the single ownership token: a callback
//! fires only if atomically removing the record succeeds at resolution
//! time, so a racing immediate call and timer tick (or a concurrent
//! [`PollingEngine::stop`]) can never double-fire. Deleting the record
//! is itself the unlock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_core::ids::TaskId;
use tether_settings::PollingSettings;

use crate::errors::PollError;

/// Future returned by one poll invocation.
///
/// `Err` is a transient request failure and counts against the failure
/// budget; it never surfaces to the caller directly.
pub type PollFuture = BoxFuture<'static, Result<PollOutcome, String>>;

/// The poll function: invoked once per tick.
pub type PollFn = Arc<dyn Fn() -> PollFuture + Send + Sync>;

/// Result of one successful poll invocation.
#[derive(Clone, Debug)]
pub enum PollOutcome {
    /// Not finished yet; poll again next tick.
    Pending,
    /// Finished; carries the result payload.
    Done(Value),
}

/// Terminal callbacks for one polled task. Each fires at most once.
pub struct PollCallbacks {
    on_success: Box<dyn FnOnce(Value) + Send + Sync>,
    on_error: Box<dyn FnOnce(PollError) + Send + Sync>,
}

impl PollCallbacks {
    /// Bundle success and error callbacks.
    #[must_use]
    pub fn new(
        on_success: impl FnOnce(Value) + Send + Sync + 'static,
        on_error: impl FnOnce(PollError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        }
    }
}

/// Timing parameters for one polled task.
#[derive(Clone, Copy, Debug)]
pub struct PollOptions {
    /// Fixed interval between polls.
    pub interval: Duration,
    /// Wall-clock budget; exceeding it is a terminal timeout.
    pub max_duration: Duration,
    /// Consecutive failures tolerated before the task is treated as
    /// expired.
    pub failure_threshold: u32,
}

impl From<PollingSettings> for PollOptions {
    fn from(settings: PollingSettings) -> Self {
        Self {
            interval: Duration::from_millis(settings.interval_ms),
            max_duration: Duration::from_millis(settings.max_duration_ms),
            failure_threshold: settings.failure_threshold,
        }
    }
}

struct Registration {
    cancel: CancellationToken,
    callbacks: PollCallbacks,
}

/// Fixed-interval poller over task-id-keyed registrations.
pub struct PollingEngine {
    registrations: DashMap<TaskId, Registration>,
}

impl PollingEngine {
    /// Create an engine with no registrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registrations: DashMap::new(),
        }
    }

    /// Whether a task is currently registered.
    #[must_use]
    pub fn is_active(&self, task_id: &TaskId) -> bool {
        self.registrations.contains_key(task_id)
    }

    /// Number of currently registered tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registrations.len()
    }

    /// Start polling `task_id`.
    ///
    /// Returns `false` without starting anything when the task is
    /// already registered.
    pub fn start(
        self: &Arc<Self>,
        task_id: TaskId,
        poll_fn: PollFn,
        callbacks: PollCallbacks,
        options: PollOptions,
    ) -> bool {
        let cancel = CancellationToken::new();
        {
            let entry = self.registrations.entry(task_id.clone());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    warn!(%task_id, "poll already registered, ignoring start");
                    return false;
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    let _ = vacant.insert(Registration {
                        cancel: cancel.clone(),
                        callbacks,
                    });
                }
            }
        }

        let engine = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            engine.poll_loop(task_id, poll_fn, options, cancel).await;
        });
        true
    }

    /// Stop polling and delete the registration.
    ///
    /// No callback fires; deletion is the unlock.
    pub fn stop(&self, task_id: &TaskId) {
        if let Some((_, registration)) = self.registrations.remove(task_id) {
            registration.cancel.cancel();
            debug!(%task_id, "poll stopped");
        }
    }

    /// Stop every registered poll (session teardown).
    pub fn stop_all(&self) {
        let task_ids: Vec<TaskId> = self
            .registrations
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for task_id in task_ids {
            self.stop(&task_id);
        }
    }

    async fn poll_loop(
        &self,
        task_id: TaskId,
        poll_fn: PollFn,
        options: PollOptions,
        cancel: CancellationToken,
    ) {
        // tokio's Instant so paused-clock tests drive the budget check.
        let started = tokio::time::Instant::now();
        let mut failures: u32 = 0;
        let mut ticker = tokio::time::interval(options.interval);

        loop {
            tokio::select! {
                // First tick fires immediately (the immediate invocation).
                _ = ticker.tick() => {}
                () = cancel.cancelled() => return,
            }

            if !self.registrations.contains_key(&task_id) {
                return;
            }

            let elapsed = started.elapsed();
            if elapsed >= options.max_duration {
                self.resolve_error(
                    &task_id,
                    PollError::TimedOut {
                        elapsed,
                        budget: options.max_duration,
                    },
                );
                return;
            }

            match poll_fn().await {
                Ok(PollOutcome::Done(result)) => {
                    self.resolve_success(&task_id, result);
                    return;
                }
                Ok(PollOutcome::Pending) => {
                    failures = 0;
                }
                Err(message) => {
                    failures += 1;
                    warn!(%task_id, failures, %message, "poll request failed");
                    if failures >= options.failure_threshold {
                        self.resolve_error(&task_id, PollError::Expired { failures });
                        return;
                    }
                }
            }
        }
    }

    /// Remove-then-fire: the removal is the atomic claim. A second
    /// resolver (racing tick, concurrent stop) finds nothing and is a
    /// silent no-op.
    fn resolve_success(&self, task_id: &TaskId, result: Value) {
        if let Some((_, registration)) = self.registrations.remove(task_id) {
            registration.cancel.cancel();
            (registration.callbacks.on_success)(result);
        }
    }

    fn resolve_error(&self, task_id: &TaskId, error: PollError) {
        if let Some((_, registration)) = self.registrations.remove(task_id) {
            registration.cancel.cancel();
            warn!(%task_id, %error, "poll terminated");
            (registration.callbacks.on_error)(error);
        }
    }
}

impl Default for PollingEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> Arc<PollingEngine> {
        Arc::new(PollingEngine::new())
    }

    fn options() -> PollOptions {
        PollOptions {
            interval: Duration::from_millis(100),
            max_duration: Duration::from_secs(60),
            failure_threshold: 5,
        }
    }

    /// Poll fn that replays a script, then stays `Pending`.
    fn scripted(
        script: Vec<Result<PollOutcome, String>>,
    ) -> (PollFn, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let queue = Arc::new(Mutex::new(VecDeque::from(script)));
        let counting = Arc::clone(&calls);
        let poll_fn: PollFn = Arc::new(move || {
            let _ = counting.fetch_add(1, Ordering::SeqCst);
            let next = queue.lock().pop_front().unwrap_or(Ok(PollOutcome::Pending));
            Box::pin(async move { next })
        });
        (poll_fn, calls)
    }

    struct Observed {
        successes: Arc<Mutex<Vec<Value>>>,
        errors: Arc<Mutex<Vec<PollError>>>,
    }

    fn observing_callbacks() -> (PollCallbacks, Observed) {
        let successes = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&successes);
        let e = Arc::clone(&errors);
        let callbacks = PollCallbacks::new(
            move |value| s.lock().push(value),
            move |error| e.lock().push(error),
        );
        (callbacks, Observed { successes, errors })
    }

    #[tokio::test(start_paused = true)]
    async fn success_fires_once_and_polling_stops() {
        let engine = engine();
        let (poll_fn, calls) = scripted(vec![
            Ok(PollOutcome::Pending),
            Ok(PollOutcome::Pending),
            Ok(PollOutcome::Done(serde_json::json!({"url": "a.png"}))),
        ]);
        let (callbacks, observed) = observing_callbacks();
        let task = TaskId::from("t1");
        assert!(engine.start(task.clone(), poll_fn, callbacks, options()));

        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(observed.successes.lock().len(), 1);
        assert_eq!(observed.successes.lock()[0]["url"], "a.png");
        assert!(observed.errors.lock().is_empty());
        assert!(!engine.is_active(&task));

        // no further poll calls after done
        let calls_at_done = calls.load(Ordering::SeqCst);
        assert_eq!(calls_at_done, 3);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), calls_at_done);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_first_invocation() {
        let engine = engine();
        let (poll_fn, calls) = scripted(vec![]);
        let (callbacks, _observed) = observing_callbacks();
        assert!(engine.start(TaskId::from("t1"), poll_fn, callbacks, options()));

        // Well under one interval: the immediate call has already happened.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_success_never() {
        let engine = engine();
        let (poll_fn, _calls) = scripted(vec![]);
        let (callbacks, observed) = observing_callbacks();
        let opts = PollOptions {
            interval: Duration::from_millis(100),
            max_duration: Duration::from_millis(450),
            failure_threshold: 5,
        };
        let task = TaskId::from("t1");
        assert!(engine.start(task.clone(), poll_fn, callbacks, opts));

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(observed.successes.lock().is_empty());
        let errors = observed.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_matches!(
            &errors[0],
            PollError::TimedOut { elapsed, budget }
                if *elapsed >= Duration::from_millis(450)
                    && *budget == Duration::from_millis(450)
        );
        assert!(!engine.is_active(&task));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_budget_fires_after_exactly_k_rejections() {
        let engine = engine();
        let (poll_fn, calls) = scripted(vec![
            Err("boom".into()),
            Err("boom".into()),
            Err("boom".into()),
        ]);
        let (callbacks, observed) = observing_callbacks();
        let opts = PollOptions {
            interval: Duration::from_millis(100),
            max_duration: Duration::from_secs(60),
            failure_threshold: 3,
        };
        assert!(engine.start(TaskId::from("t1"), poll_fn, callbacks, opts));

        // After two rejections: nothing fired yet.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(observed.errors.lock().is_empty());

        // Third rejection exhausts the budget.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let errors = observed.errors.lock();
        assert_eq!(errors.len(), 1);
        assert_matches!(&errors[0], PollError::Expired { failures: 3 });
        drop(errors);

        // Not retried further.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_counter_resets_on_any_success() {
        let engine = engine();
        let (poll_fn, _calls) = scripted(vec![
            Err("a".into()),
            Err("b".into()),
            Ok(PollOutcome::Pending), // resets the counter
            Err("c".into()),
            Err("d".into()),
            Ok(PollOutcome::Done(serde_json::json!(null))),
        ]);
        let (callbacks, observed) = observing_callbacks();
        let opts = PollOptions {
            interval: Duration::from_millis(100),
            max_duration: Duration::from_secs(60),
            failure_threshold: 3,
        };
        assert!(engine.start(TaskId::from("t1"), poll_fn, callbacks, opts));

        tokio::time::sleep(Duration::from_millis(700)).await;

        // Budget never exhausted thanks to the reset; task completed.
        assert!(observed.errors.lock().is_empty());
        assert_eq!(observed.successes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_callbacks() {
        let engine = engine();
        let (poll_fn, calls) = scripted(vec![
            Ok(PollOutcome::Pending),
            Ok(PollOutcome::Done(serde_json::json!(1))),
        ]);
        let (callbacks, observed) = observing_callbacks();
        let task = TaskId::from("t1");
        assert!(engine.start(task.clone(), poll_fn, callbacks, options()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.stop(&task);
        assert!(!engine.is_active(&task));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(observed.successes.lock().is_empty());
        assert!(observed.errors.lock().is_empty());
        // The loop exited: only the immediate call happened.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_resolution_is_noop() {
        let engine = engine();
        let (poll_fn, _calls) =
            scripted(vec![Ok(PollOutcome::Done(serde_json::json!(1)))]);
        let (callbacks, observed) = observing_callbacks();
        let task = TaskId::from("t1");
        assert!(engine.start(task.clone(), poll_fn, callbacks, options()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observed.successes.lock().len(), 1);

        engine.stop(&task);
        assert_eq!(observed.successes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_start_refused() {
        let engine = engine();
        let (poll_fn_a, calls_a) = scripted(vec![]);
        let (poll_fn_b, calls_b) = scripted(vec![]);
        let (callbacks_a, _oa) = observing_callbacks();
        let (callbacks_b, _ob) = observing_callbacks();
        let task = TaskId::from("t1");

        assert!(engine.start(task.clone(), poll_fn_a, callbacks_a, options()));
        assert!(!engine.start(task.clone(), poll_fn_b, callbacks_b, options()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(calls_a.load(Ordering::SeqCst) > 0);
        assert_eq!(calls_b.load(Ordering::SeqCst), 0);
        assert_eq!(engine.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_clears_every_registration() {
        let engine = engine();
        let (poll_fn_a, _ca) = scripted(vec![]);
        let (poll_fn_b, _cb) = scripted(vec![]);
        let (callbacks_a, oa) = observing_callbacks();
        let (callbacks_b, ob) = observing_callbacks();
        assert!(engine.start(TaskId::from("a"), poll_fn_a, callbacks_a, options()));
        assert!(engine.start(TaskId::from("b"), poll_fn_b, callbacks_b, options()));

        engine.stop_all();
        assert_eq!(engine.active_count(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(oa.successes.lock().is_empty());
        assert!(oa.errors.lock().is_empty());
        assert!(ob.successes.lock().is_empty());
        assert!(ob.errors.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn independent_tasks_poll_independently() {
        let engine = engine();
        let (poll_fn_a, _ca) =
            scripted(vec![Ok(PollOutcome::Done(serde_json::json!("a")))]);
        let (poll_fn_b, calls_b) = scripted(vec![]);
        let (callbacks_a, oa) = observing_callbacks();
        let (callbacks_b, _ob) = observing_callbacks();

        assert!(engine.start(TaskId::from("a"), poll_fn_a, callbacks_a, options()));
        assert!(engine.start(TaskId::from("b"), poll_fn_b, callbacks_b, options()));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(oa.successes.lock().len(), 1);
        // b keeps polling after a resolved
        assert!(engine.is_active(&TaskId::from("b")));
        assert!(calls_b.load(Ordering::SeqCst) >= 2);
    }
}
