use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::alert::AlertRouter;
use crate::callsite::CallSite;
use crate::config::MonitorConfig;
use crate::event::{Event, EventDraft, EventFilter, EventKind, Severity};
use crate::health::{HealthAggregator, HealthReport};
use crate::metrics::MetricsRegistry;
use crate::monitors::{
    EventLoopMonitor, MemoryMonitor, MemoryReader, MemorySnapshot, SysinfoReader, TaskTracker,
    TrackedTaskSnapshot, UnawaitedDetector,
};
use crate::store::{EventStore, StoreStats, SubscriberId};
use crate::tracked::{Tracked, Watched};
use crate::{Error, Result};

/// Bound on graceful shutdown before tasks are aborted (and, on the
/// signal path, the process is force-exited).
pub(crate) const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

static PANIC_STORE: Mutex<Weak<EventStore>> = Mutex::new(Weak::new());
static PANIC_HOOK: Once = Once::new();

struct RuntimeState {
    token: CancellationToken,
    tasks: JoinSet<()>,
    bridge: SubscriberId,
}

/// Point-in-time roll-up returned by [`HealthMonitor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub uptime_ms: u64,
    pub pid: u32,
    pub runtime: String,
    pub monitors: HealthReport,
    pub events: StoreStats,
}

/// The orchestrator: owns the four monitoring subsystems, the event
/// store, the alert router and the metrics registry, and drives their
/// lifecycle.
///
/// Construction validates the configuration and is all-or-nothing;
/// [`start`](Self::start) and [`stop`](Self::stop) are idempotent.
///
/// # Example
///
/// ```ignore
/// let monitor = Arc::new(HealthMonitor::new(MonitorConfig::default())?);
/// monitor.start()?;
///
/// // Instrument interesting tasks:
/// let result = monitor.tracked(fetch_everything()).await;
///
/// monitor.stop().await;
/// ```
pub struct HealthMonitor {
    config: MonitorConfig,
    store: Arc<EventStore>,
    router: Arc<AlertRouter>,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthAggregator>,
    event_loop: Arc<EventLoopMonitor>,
    memory: Arc<MemoryMonitor>,
    task_tracker: Arc<TaskTracker>,
    unawaited: Arc<UnawaitedDetector>,
    running: AtomicBool,
    runtime: Mutex<Option<RuntimeState>>,
}

impl HealthMonitor {
    /// Construct with the default (`sysinfo`-backed) memory reader.
    pub fn new(config: MonitorConfig) -> Result<Self> {
        Self::with_reader(config, Arc::new(SysinfoReader::new()))
    }

    /// Construct with a custom memory reader (embedders, tests).
    pub fn with_reader(config: MonitorConfig, reader: Arc<dyn MemoryReader>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(EventStore::new());
        let health = Arc::new(HealthAggregator::new());
        let event_loop = Arc::new(EventLoopMonitor::new(
            config.event_loop,
            store.clone(),
            health.clone(),
        ));
        let memory = Arc::new(MemoryMonitor::new(
            config.memory,
            store.clone(),
            health.clone(),
            reader,
        ));
        let task_tracker = Arc::new(TaskTracker::new(
            config.tasks,
            store.clone(),
            health.clone(),
        ));
        let unawaited = Arc::new(UnawaitedDetector::new(
            config.unawaited,
            store.clone(),
            health.clone(),
        ));

        Ok(Self {
            config,
            store,
            router: Arc::new(AlertRouter::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            health,
            event_loop,
            memory,
            task_tracker,
            unawaited,
            running: AtomicBool::new(false),
            runtime: Mutex::new(None),
        })
    }

    /// Arm every enabled monitor. Idempotent: a second call warns and
    /// returns without starting anything new.
    ///
    /// # Errors
    ///
    /// [`Error::NoRuntime`] when called outside a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("health monitor already running, ignoring start");
            return Ok(());
        }

        let token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        // Bridge store emissions to the alert router, metrics and the
        // health roll-up. Routing runs as its own task per event so one
        // slow sink never delays the next event's dispatch.
        let bridge = {
            let router = self.router.clone();
            let metrics = self.metrics.clone();
            let health = self.health.clone();
            self.store.subscribe(None, move |event: &Arc<Event>| {
                health.record_event();
                metrics.inc_counter("vigil_events_total", &[("kind", event.kind.as_str())]);
                let router = router.clone();
                let event = event.clone();
                handle.spawn(async move {
                    router.route(&event).await;
                });
            })
        };

        if self.config.event_loop.enabled {
            self.arm_guarded("event-loop", &token, &mut tasks, |token, tasks| {
                self.event_loop.spawn(token, tasks);
            });
        }
        if self.config.memory.enabled {
            self.arm_guarded("memory", &token, &mut tasks, |token, tasks| {
                self.memory.spawn(token, tasks);
            });
        }
        if self.config.tasks.enabled {
            self.arm_guarded("task-tracker", &token, &mut tasks, |token, tasks| {
                self.task_tracker.spawn(token, tasks);
            });
        }
        if self.config.unawaited.enabled {
            self.arm_guarded("unawaited-tasks", &token, &mut tasks, |token, tasks| {
                self.unawaited.spawn(token, tasks);
            });
        }

        install_panic_hook(&self.store);

        *self.runtime.lock().unwrap() = Some(RuntimeState {
            token,
            tasks,
            bridge,
        });

        self.store.emit(
            EventDraft::new(EventKind::SystemInfo)
                .source("orchestrator")
                .payload("reason", "monitor-started")
                .payload("mode", self.config.mode.as_str()),
        );
        Ok(())
    }

    /// Register hooks for one monitor inside a guard: a failure disables
    /// that monitor and is reported as a critical SystemInfo event, but
    /// never fails `start` as a whole.
    fn arm_guarded(
        &self,
        name: &'static str,
        token: &CancellationToken,
        tasks: &mut JoinSet<()>,
        arm: impl FnOnce(CancellationToken, &mut JoinSet<()>),
    ) {
        let result = catch_unwind(AssertUnwindSafe(|| arm(token.clone(), tasks)));
        if result.is_err() {
            match name {
                "task-tracker" => self.task_tracker.disable(),
                "unawaited-tasks" => self.unawaited.disable(),
                _ => {}
            }
            self.health.record_monitor_check(name, false);
            self.store.record_internal_error("hook-install");
            tracing::error!(monitor = name, "hook installation failed, monitor disabled");
            self.store.emit(
                EventDraft::new(EventKind::SystemInfo)
                    .severity(Severity::Critical)
                    .source("orchestrator")
                    .payload("reason", "hook-install-failed")
                    .payload("monitor", name),
            );
        }
    }

    /// Disarm every periodic task and release hooks. Idempotent and safe
    /// to call before `start`; once it returns, no monitor emits.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let state = self.runtime.lock().unwrap().take();
        let Some(mut state) = state else { return };

        state.token.cancel();
        self.store.unsubscribe(state.bridge);

        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while state.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::error!("monitor tasks did not stop within the shutdown bound, aborting them");
            state.tasks.abort_all();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Listen for interrupt/terminate and stop the monitors cleanly,
    /// forcing exit if cleanup exceeds the shutdown bound.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<()> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let weak = Arc::downgrade(self);
        handle.spawn(async move {
            wait_for_shutdown_signal().await;
            let Some(monitor) = weak.upgrade() else { return };
            tracing::info!("shutdown signal received, stopping monitors");
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, monitor.stop())
                .await
                .is_err()
            {
                tracing::error!("cleanup exceeded the shutdown bound, forcing exit");
                std::process::exit(1);
            }
        });
        Ok(())
    }

    // ==================== queries ====================

    pub fn status(&self) -> StatusReport {
        StatusReport {
            running: self.is_running(),
            uptime_ms: self.health.uptime_ms(),
            pid: std::process::id(),
            runtime: runtime_label(),
            monitors: self.health.report(self.memory.current_heap_used()),
            events: self.store.stats(),
        }
    }

    /// Status as pretty JSON.
    pub fn status_json(&self) -> String {
        serde_json::to_string_pretty(&self.status()).unwrap_or_default()
    }

    pub fn events(&self, filter: EventFilter) -> Vec<Arc<Event>> {
        self.store.events(filter)
    }

    pub fn pending_tasks(&self) -> Vec<TrackedTaskSnapshot> {
        self.task_tracker.pending_tasks()
    }

    pub fn memory_snapshots(&self) -> Vec<MemorySnapshot> {
        self.memory.snapshots()
    }

    /// Ask the runtime to collect garbage; reports whether the request
    /// was honored.
    pub fn force_gc(&self) -> bool {
        self.memory.force_gc()
    }

    /// Subscribe to events of one kind, or to all with `None`.
    pub fn on(
        &self,
        kind: Option<EventKind>,
        handler: impl Fn(&Arc<Event>) + Send + Sync + 'static,
    ) -> SubscriberId {
        self.store.subscribe(kind, handler)
    }

    pub fn off(&self, id: SubscriberId) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<AlertRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    // ==================== instrumentation ====================

    /// Track a future's lifecycle for deadlock detection. The call-site
    /// becomes the task's originating file/line.
    #[track_caller]
    pub fn tracked<F: Future>(&self, fut: F) -> Tracked<F> {
        self.tracked_at(CallSite::capture(), fut)
    }

    /// Like [`tracked`](Self::tracked) with an explicit call-site
    /// (framework glue that wraps on the user's behalf).
    pub fn tracked_at<F: Future>(&self, callsite: CallSite, fut: F) -> Tracked<F> {
        self.task_tracker.instrument(callsite, fut)
    }

    /// Watch a future for unobserved completion: if it is never polled
    /// before the warning threshold, an UnawaitedTask event is emitted.
    #[track_caller]
    pub fn watch<F: Future>(&self, fut: F) -> Watched<F> {
        self.watch_at(CallSite::capture(), fut)
    }

    /// Like [`watch`](Self::watch) with an explicit call-site.
    pub fn watch_at<F: Future>(&self, callsite: CallSite, fut: F) -> Watched<F> {
        self.unawaited.instrument(callsite, fut)
    }

    /// Race `fut` against a timer. On timeout the returned future
    /// resolves to [`Error::Timeout`]; the underlying task is NOT
    /// cancelled (it keeps running detached), the monitor merely stops
    /// waiting.
    pub async fn with_timeout<F>(&self, duration: Duration, fut: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(fut);
        match tokio::time::timeout(duration, handle).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join_error)) => Err(Error::external(join_error)),
            Err(_) => Err(Error::Timeout(duration)),
        }
    }

    pub(crate) fn event_loop_monitor(&self) -> &Arc<EventLoopMonitor> {
        &self.event_loop
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("running", &self.is_running())
            .field("mode", &self.config.mode)
            .finish_non_exhaustive()
    }
}

fn runtime_label() -> String {
    match Handle::try_current() {
        Ok(handle) => format!("tokio-{:?}", handle.runtime_flavor()).to_lowercase(),
        Err(_) => "none".to_string(),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Translate panics into critical SystemInfo events. The previous hook
/// still runs afterwards; vigil never becomes the terminal handler.
fn install_panic_hook(store: &Arc<EventStore>) {
    *PANIC_STORE.lock().unwrap() = Arc::downgrade(store);
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // Panics raised inside vigil's own files are already
            // contained (subscriber isolation, hook guards); reporting
            // them here would let the monitor observe itself.
            let internal = info
                .location()
                .map_or(false, |l| crate::callsite::is_monitor_path(l.file()));
            if internal {
                previous(info);
                return;
            }
            if let Some(store) = PANIC_STORE.lock().unwrap().upgrade() {
                let message = info
                    .payload()
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| info.payload().downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                let mut draft = EventDraft::new(EventKind::SystemInfo)
                    .severity(Severity::Critical)
                    .source("panic-hook")
                    .payload("reason", "uncaught-panic")
                    .payload("message", message);
                if let Some(location) = info.location() {
                    draft = draft.file_line(location.file().to_string(), location.line());
                }
                store.emit(draft);
            }
            previous(info);
        }));
    });
}
