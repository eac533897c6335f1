use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde::Serialize;

use crate::monitors::task_tracker::TaskTracker;
use crate::monitors::unawaited::UnawaitedDetector;

/// Identifier of a task registered with the task tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identifier of a task registered with the unawaited-task detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WatchId(pub(crate) u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

thread_local! {
    /// The tracked task currently being polled on this thread. Read at
    /// construction time to link a child task to the task that created
    /// it (the causal "trigger" edge used for cycle detection).
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// The tracked task whose poll is currently on the stack, if any.
pub(crate) fn current_task() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

/// A future instrumented by the task tracker.
///
/// Created by [`HealthMonitor::tracked`](crate::HealthMonitor::tracked).
/// Registration happens at construction; completion or drop reports the
/// task as observed. While this future is being polled, tasks
/// constructed inside it record it as their trigger.
#[must_use = "futures do nothing unless polled"]
pub struct Tracked<F> {
    inner: F,
    id: Option<TaskId>,
    tracker: Arc<TaskTracker>,
}

impl<F> Tracked<F> {
    pub(crate) fn new(inner: F, id: Option<TaskId>, tracker: Arc<TaskTracker>) -> Self {
        Self { inner, id, tracker }
    }

    /// The tracker id, or `None` when the call-site was filtered out or
    /// the tracker is disabled.
    pub fn task_id(&self) -> Option<TaskId> {
        self.id
    }
}

impl<F: Future> Future for Tracked<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is structurally pinned and never moved out of
        // `this`; the remaining fields are ordinary unpinned data.
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };

        let previous = CURRENT_TASK.with(|c| c.replace(this.id));
        let poll = inner.poll(cx);
        CURRENT_TASK.with(|c| c.set(previous));

        if poll.is_ready() {
            if let Some(id) = this.id.take() {
                this.tracker.on_destroy(id);
            }
        }
        poll
    }
}

impl<F> Drop for Tracked<F> {
    fn drop(&mut self) {
        // A drop before completion (cancellation) still observes the task.
        if let Some(id) = self.id.take() {
            self.tracker.on_destroy(id);
        }
    }
}

impl<F> std::fmt::Debug for Tracked<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked").field("id", &self.id).finish_non_exhaustive()
    }
}

/// A future instrumented by the unawaited-task detector.
///
/// Created by [`HealthMonitor::watch`](crate::HealthMonitor::watch).
/// The first poll marks the task observed (a continuation is attached);
/// settling schedules its entry for removal. A `Watched` that is never
/// polled is reported once its age passes the warning threshold.
#[must_use = "a Watched task that is never awaited will be reported as unawaited"]
pub struct Watched<F> {
    inner: F,
    id: Option<WatchId>,
    polled: bool,
    detector: Arc<UnawaitedDetector>,
}

impl<F> Watched<F> {
    pub(crate) fn new(inner: F, id: Option<WatchId>, detector: Arc<UnawaitedDetector>) -> Self {
        Self {
            inner,
            id,
            polled: false,
            detector,
        }
    }

    pub fn watch_id(&self) -> Option<WatchId> {
        self.id
    }
}

impl<F: Future> Future for Watched<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `inner` is structurally pinned and never moved out of
        // `this`; the remaining fields are ordinary unpinned data.
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };

        if !this.polled {
            this.polled = true;
            if let Some(id) = this.id {
                this.detector.mark_observed(id);
            }
        }

        let poll = inner.poll(cx);
        if poll.is_ready() {
            if let Some(id) = this.id.take() {
                this.detector.on_settled(id);
            }
        }
        poll
    }
}

impl<F> Drop for Watched<F> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.detector.on_dropped(id, self.polled);
        }
    }
}

impl<F> std::fmt::Debug for Watched<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watched")
            .field("id", &self.id)
            .field("polled", &self.polled)
            .finish_non_exhaustive()
    }
}
