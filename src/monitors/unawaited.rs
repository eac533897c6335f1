use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::callsite::{self, CallSite};
use crate::config::UnawaitedConfig;
use crate::event::{EventDraft, EventKind};
use crate::health::HealthAggregator;
use crate::store::EventStore;
use crate::tracked::{WatchId, Watched};

const MONITOR_NAME: &str = "unawaited-tasks";

/// Extra grace added to the warning threshold before a settled entry is
/// dropped.
const SETTLE_GRACE: Duration = Duration::from_secs(1);

/// User frames kept in a reported stack.
const STACK_FRAME_LIMIT: usize = 10;

#[derive(Debug)]
struct WatchEntry {
    created_at: Instant,
    file: &'static str,
    line: u32,
    stack: Option<String>,
    observed: bool,
    remove_after: Option<Instant>,
}

/// Warns about tasks whose completion was never observed: a [`Watched`]
/// future that is neither awaited nor spawned before the warning
/// threshold elapses.
///
/// Observation is one-way: the first poll marks the entry observed and
/// it is never reported. Call-sites inside vigil's own source are
/// filtered with the same rules as the task tracker.
pub struct UnawaitedDetector {
    config: UnawaitedConfig,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    entries: Mutex<HashMap<WatchId, WatchEntry>>,
    next_id: AtomicU64,
    enabled: AtomicBool,
}

impl UnawaitedDetector {
    pub fn new(
        config: UnawaitedConfig,
        store: Arc<EventStore>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            store,
            health,
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Wrap a future so this detector can tell whether its completion is
    /// ever observed.
    pub(crate) fn instrument<F: Future>(
        self: &Arc<Self>,
        callsite: CallSite,
        inner: F,
    ) -> Watched<F> {
        let id = self.register(callsite);
        Watched::new(inner, id, self.clone())
    }

    pub(crate) fn register(&self, callsite: CallSite) -> Option<WatchId> {
        if !self.enabled.load(Ordering::Relaxed) || callsite.is_internal() {
            return None;
        }
        let stack = callsite::capture_stack();
        let mut entries = self.entries.lock().unwrap();
        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        entries.insert(
            id,
            WatchEntry {
                created_at: Instant::now(),
                file: callsite.file,
                line: callsite.line,
                stack,
                observed: false,
                remove_after: None,
            },
        );
        Some(id)
    }

    /// A continuation was attached (first poll). One-way.
    pub(crate) fn mark_observed(&self, id: WatchId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            entry.observed = true;
        }
    }

    /// The task settled; keep the entry briefly for late queries, then
    /// forget it.
    pub(crate) fn on_settled(&self, id: WatchId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            entry.remove_after =
                Some(Instant::now() + self.config.warning_threshold + SETTLE_GRACE);
        }
    }

    /// The wrapper was dropped. A polled wrapper was observed and can be
    /// forgotten on schedule; an unpolled one stays so the watchdog can
    /// still report it.
    pub(crate) fn on_dropped(&self, id: WatchId, polled: bool) {
        if polled {
            self.on_settled(id);
        }
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn watched_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn spawn(self: &Arc<Self>, token: CancellationToken, tasks: &mut JoinSet<()>) {
        let detector = self.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(detector.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // completes immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => detector.tick(),
                }
            }
        });
    }

    /// One sweep: drop settled entries past their removal time, then
    /// report and forget every unobserved entry older than the warning
    /// threshold.
    pub(crate) fn tick(&self) {
        struct Emission {
            age: Duration,
            file: &'static str,
            line: u32,
            stack: Option<String>,
        }

        let now = Instant::now();
        let mut emissions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|_, e| e.remove_after.map_or(true, |deadline| deadline > now));

            let expired: Vec<WatchId> = entries
                .iter()
                .filter(|(_, e)| {
                    !e.observed
                        && now.duration_since(e.created_at) > self.config.warning_threshold
                })
                .map(|(id, _)| *id)
                .collect();

            // Forget reported entries immediately: one warning per task.
            for id in expired {
                let entry = entries.remove(&id).expect("expired entry present");
                emissions.push(Emission {
                    age: now.duration_since(entry.created_at),
                    file: entry.file,
                    line: entry.line,
                    stack: entry
                        .stack
                        .as_deref()
                        .map(|s| callsite::clean_stack(s, STACK_FRAME_LIMIT)),
                });
            }
        }

        self.health.record_monitor_check(MONITOR_NAME, true);

        for emission in emissions {
            let mut draft = EventDraft::new(EventKind::UnawaitedTask)
                .source("unawaited-task-detector")
                .payload("ageMs", emission.age.as_millis() as u64)
                .file_line(emission.file, emission.line)
                .suggestion(
                    "Await this task, spawn it, or explicitly drop its result; an \
                     unobserved task silently swallows errors",
                );
            if let Some(stack) = emission.stack {
                if !stack.is_empty() {
                    draft = draft.stack(stack);
                }
            }
            self.store.emit(draft);
        }
    }

    #[cfg(test)]
    fn age_entry(&self, id: WatchId, by: Duration) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&id) {
            if let Some(back_dated) = entry.created_at.checked_sub(by) {
                entry.created_at = back_dated;
            }
        }
    }
}

impl std::fmt::Debug for UnawaitedDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnawaitedDetector")
            .field("watched", &self.watched_count())
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::task::{Context, Poll};

    use futures_util::task::noop_waker;

    use super::*;
    use crate::event::{EventFilter, Severity};

    fn detector() -> (Arc<UnawaitedDetector>, Arc<EventStore>) {
        let store = Arc::new(EventStore::new());
        let health = Arc::new(HealthAggregator::new());
        let config = UnawaitedConfig {
            enabled: true,
            check_interval: Duration::from_secs(3),
            warning_threshold: Duration::from_secs(5),
        };
        (
            Arc::new(UnawaitedDetector::new(config, store.clone(), health)),
            store,
        )
    }

    fn user_site(line: u32) -> CallSite {
        CallSite::at("examples/app.rs", line)
    }

    #[test]
    fn internal_callsites_are_filtered() {
        let (detector, _) = detector();
        assert!(detector
            .register(CallSite::at("src/monitors/unawaited.rs", 1))
            .is_none());
        assert_eq!(detector.watched_count(), 0);
    }

    #[test]
    fn unobserved_old_task_is_warned_once_then_forgotten() {
        let (detector, store) = detector();
        let id = detector.register(user_site(21)).unwrap();
        detector.age_entry(id, Duration::from_secs(10));

        detector.tick();
        detector.tick();

        let events = store.events(EventFilter::new().kind(EventKind::UnawaitedTask));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(event.file.as_deref(), Some("examples/app.rs"));
        assert_eq!(event.line, Some(21));
        assert!(event.payload["ageMs"].as_u64().unwrap() >= 10_000);
        assert_eq!(detector.watched_count(), 0);
    }

    #[test]
    fn young_unobserved_task_is_not_warned_yet() {
        let (detector, store) = detector();
        detector.register(user_site(1)).unwrap();
        detector.tick();
        assert!(store
            .events(EventFilter::new().kind(EventKind::UnawaitedTask))
            .is_empty());
        assert_eq!(detector.watched_count(), 1);
    }

    #[test]
    fn observed_task_is_never_warned() {
        let (detector, store) = detector();
        let id = detector.register(user_site(1)).unwrap();
        detector.mark_observed(id);
        detector.age_entry(id, Duration::from_secs(60));

        detector.tick();
        assert!(store
            .events(EventFilter::new().kind(EventKind::UnawaitedTask))
            .is_empty());
    }

    #[test]
    fn settled_entry_is_removed_after_the_grace_period() {
        let (detector, _) = detector();
        let id = detector.register(user_site(1)).unwrap();
        detector.mark_observed(id);
        detector.on_settled(id);
        assert_eq!(detector.watched_count(), 1);

        // Pull the removal deadline into the past.
        {
            let mut entries = detector.entries.lock().unwrap();
            entries.get_mut(&id).unwrap().remove_after = Some(Instant::now());
        }
        detector.tick();
        assert_eq!(detector.watched_count(), 0);
    }

    #[test]
    fn awaited_watched_future_is_observed() {
        let (detector, store) = detector();
        let fut = detector.instrument(user_site(5), async { "done" });
        let id = fut.watch_id().unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut pinned = Box::pin(fut);
        assert_eq!(pinned.as_mut().poll(&mut cx), Poll::Ready("done"));

        detector.age_entry(id, Duration::from_secs(60));
        detector.tick();
        assert!(store
            .events(EventFilter::new().kind(EventKind::UnawaitedTask))
            .is_empty());
    }

    #[test]
    fn dropped_unpolled_future_is_still_reported() {
        let (detector, store) = detector();
        let fut = detector.instrument(user_site(5), async {});
        let id = fut.watch_id().unwrap();
        drop(fut);

        detector.age_entry(id, Duration::from_secs(60));
        detector.tick();
        let events = store.events(EventFilter::new().kind(EventKind::UnawaitedTask));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn disabled_detector_registers_nothing() {
        let (detector, _) = detector();
        detector.disable();
        assert!(detector.register(user_site(1)).is_none());
    }
}
