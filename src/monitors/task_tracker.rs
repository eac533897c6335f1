use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::callsite::{self, CallSite};
use crate::config::TaskConfig;
use crate::event::{wall_clock_ms, EventDraft, EventKind};
use crate::health::HealthAggregator;
use crate::store::EventStore;
use crate::tracked::{current_task, TaskId, Tracked};

const MONITOR_NAME: &str = "task-tracker";

/// How long a non-pending task stays queryable after being observed.
const REMOVAL_DELAY: Duration = Duration::from_secs(60);

/// Depth cap for walks over the trigger graph.
const GRAPH_DEPTH_LIMIT: usize = 10;

/// User frames kept in a reported stack.
const STACK_FRAME_LIMIT: usize = 10;

/// Lifecycle of a tracked task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Created, completion not yet observed.
    Pending,
    /// Completed or dropped.
    Observed,
    /// Surfaced as a deadlock; kept to suppress repeats.
    ReportedStuck,
}

#[derive(Debug)]
struct TaskEntry {
    created_at: Instant,
    created_ms: u64,
    file: &'static str,
    line: u32,
    status: TaskStatus,
    trigger: Option<TaskId>,
    stack: Option<String>,
    remove_after: Option<Instant>,
}

/// Immutable view of a tracked task, for post-mortem queries.
#[derive(Debug, Clone, Serialize)]
pub struct TrackedTaskSnapshot {
    pub id: TaskId,
    pub created_ms: u64,
    pub age_ms: u64,
    pub file: String,
    pub line: u32,
    pub status: TaskStatus,
    pub trigger: Option<TaskId>,
}

/// Observes task creation and completion, and reports tasks that stay
/// pending past the deadlock threshold — flagging circular waits among
/// them.
///
/// Tasks whose originating call-site lies inside vigil's own source are
/// never tracked; the monitor's periodic tasks must not observe
/// themselves.
pub struct TaskTracker {
    config: TaskConfig,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
    next_id: AtomicU64,
    enabled: AtomicBool,
}

impl TaskTracker {
    pub fn new(config: TaskConfig, store: Arc<EventStore>, health: Arc<HealthAggregator>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            store,
            health,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Wrap a future so its lifecycle is reported to this tracker.
    pub(crate) fn instrument<F: Future>(self: &Arc<Self>, callsite: CallSite, inner: F) -> Tracked<F> {
        let id = self.register(callsite);
        Tracked::new(inner, id, self.clone())
    }

    /// Record a task created at `callsite`, linking it to the tracked
    /// task currently being polled. Returns `None` when the call-site is
    /// internal or the tracker is disabled.
    pub(crate) fn register(&self, callsite: CallSite) -> Option<TaskId> {
        self.register_with_trigger(callsite, current_task())
    }

    pub(crate) fn register_with_trigger(
        &self,
        callsite: CallSite,
        trigger: Option<TaskId>,
    ) -> Option<TaskId> {
        if !self.enabled.load(Ordering::Relaxed) || callsite.is_internal() {
            return None;
        }

        let stack = callsite::capture_stack();
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.len() >= self.config.max_tracked {
            Self::evict_oldest_observed(&mut tasks);
        }

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        tasks.insert(
            id,
            TaskEntry {
                created_at: Instant::now(),
                created_ms: wall_clock_ms(),
                file: callsite.file,
                line: callsite.line,
                status: TaskStatus::Pending,
                trigger,
                stack,
                remove_after: None,
            },
        );
        Some(id)
    }

    /// Mark a task's completion observed. Removal is deferred so the
    /// entry stays available for post-mortem queries.
    pub(crate) fn on_destroy(&self, id: TaskId) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(entry) = tasks.get_mut(&id) {
            if entry.status == TaskStatus::Pending {
                entry.status = TaskStatus::Observed;
            }
            entry.remove_after = Some(Instant::now() + REMOVAL_DELAY);
        }
    }

    /// Disable registration (hook failure or production preset). Already
    /// tracked tasks keep their lifecycle.
    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Tasks still pending, oldest first.
    pub fn pending_tasks(&self) -> Vec<TrackedTaskSnapshot> {
        let tasks = self.tasks.lock().unwrap();
        let mut pending: Vec<TrackedTaskSnapshot> = tasks
            .iter()
            .filter(|(_, e)| e.status == TaskStatus::Pending)
            .map(|(id, e)| TrackedTaskSnapshot {
                id: *id,
                created_ms: e.created_ms,
                age_ms: e.created_at.elapsed().as_millis() as u64,
                file: e.file.to_string(),
                line: e.line,
                status: e.status,
                trigger: e.trigger,
            })
            .collect();
        pending.sort_by_key(|t| t.id);
        pending
    }

    pub fn tracked_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub(crate) fn spawn(self: &Arc<Self>, token: CancellationToken, tasks: &mut JoinSet<()>) {
        let tracker = self.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(tracker.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // completes immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tracker.tick(),
                }
            }
        });
    }

    /// One watchdog pass: drop expired observed entries, then surface
    /// every pending task older than the deadlock threshold.
    pub(crate) fn tick(&self) {
        struct Emission {
            id: TaskId,
            age: Duration,
            file: &'static str,
            line: u32,
            circular: bool,
            related: usize,
            stack: Option<String>,
        }

        let now = Instant::now();
        let mut emissions = Vec::new();
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.retain(|_, e| {
                e.status == TaskStatus::Pending
                    || e.remove_after.map_or(true, |deadline| deadline > now)
            });

            let candidates: Vec<TaskId> = tasks
                .iter()
                .filter(|(_, e)| {
                    e.status == TaskStatus::Pending
                        && now.duration_since(e.created_at) >= self.config.deadlock_threshold
                })
                .map(|(id, _)| *id)
                .collect();

            // Classify every candidate against the graph as it stood at
            // the start of the sweep, then mark them stuck; marking
            // first would break cycle checks for later candidates.
            for id in &candidates {
                let related = count_descendants(&tasks, *id);
                let circular = has_pending_cycle(&tasks, *id);
                let entry = &tasks[id];
                emissions.push(Emission {
                    id: *id,
                    age: now.duration_since(entry.created_at),
                    file: entry.file,
                    line: entry.line,
                    circular,
                    related,
                    stack: entry
                        .stack
                        .as_deref()
                        .map(|s| callsite::clean_stack(s, STACK_FRAME_LIMIT)),
                });
            }
            for id in &candidates {
                if let Some(entry) = tasks.get_mut(id) {
                    entry.status = TaskStatus::ReportedStuck;
                }
            }
        }

        self.health.record_monitor_check(MONITOR_NAME, true);

        for emission in emissions {
            let mut draft = EventDraft::new(EventKind::TaskDeadlock)
                .source("task-tracker")
                .payload("taskId", emission.id.to_string())
                .payload("ageSeconds", emission.age.as_secs())
                .payload("isCircular", emission.circular)
                .payload("relatedCount", emission.related)
                .file_line(emission.file, emission.line)
                .suggestion(if emission.circular {
                    "Tasks are waiting on each other in a cycle; break the cycle or add a timeout"
                } else {
                    "Task has been pending past the deadlock threshold; check for a missing wake, \
                     an unresolved channel recv, or a lost oneshot sender"
                });
            if let Some(stack) = emission.stack {
                if !stack.is_empty() {
                    draft = draft.stack(stack);
                }
            }
            self.store.emit(draft);
        }
    }

    /// Drop the oldest 20% of non-pending entries to make room.
    fn evict_oldest_observed(tasks: &mut HashMap<TaskId, TaskEntry>) {
        let mut observed: Vec<(TaskId, Instant)> = tasks
            .iter()
            .filter(|(_, e)| e.status != TaskStatus::Pending)
            .map(|(id, e)| (*id, e.created_at))
            .collect();
        observed.sort_by_key(|(_, created)| *created);

        let quota = (tasks.len() / 5).max(1);
        for (id, _) in observed.into_iter().take(quota) {
            tasks.remove(&id);
        }
    }

    #[cfg(test)]
    fn expire_entry(&self, id: TaskId) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(entry) = tasks.get_mut(&id) {
            // The watchdog captures its own, strictly later `now`.
            entry.remove_after = Some(Instant::now());
        }
    }
}

/// Number of tasks transitively triggered by `root`, walked over the
/// child edges of the trigger graph with a depth cap.
fn count_descendants(tasks: &HashMap<TaskId, TaskEntry>, root: TaskId) -> usize {
    let mut children: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for (id, entry) in tasks {
        if let Some(trigger) = entry.trigger {
            children.entry(trigger).or_default().push(*id);
        }
    }

    let mut seen: HashSet<TaskId> = HashSet::new();
    let mut frontier = vec![root];
    for _ in 0..GRAPH_DEPTH_LIMIT {
        let mut next = Vec::new();
        for id in frontier {
            for child in children.get(&id).into_iter().flatten() {
                if seen.insert(*child) {
                    next.push(*child);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }
    seen.len()
}

/// True when following trigger back-edges from `root` returns to `root`
/// through only pending tasks.
fn has_pending_cycle(tasks: &HashMap<TaskId, TaskEntry>, root: TaskId) -> bool {
    let mut current = tasks.get(&root).and_then(|e| e.trigger);
    for _ in 0..GRAPH_DEPTH_LIMIT {
        match current {
            Some(id) if id == root => return true,
            Some(id) => match tasks.get(&id) {
                Some(entry) if entry.status == TaskStatus::Pending => current = entry.trigger,
                _ => return false,
            },
            None => return false,
        }
    }
    false
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("tracked", &self.tracked_count())
            .field("enabled", &self.enabled)
            .finish()
    }
}
