use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::budget::ErrorBudget;
use crate::event::{wall_clock_ms, Event, EventDraft, EventFilter, EventKind, Severity};

/// Maximum number of events retained in the ring.
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Identifier returned by [`EventStore::subscribe`], used to unsubscribe.
pub type SubscriberId = u64;

type Handler = Arc<dyn Fn(&Arc<Event>) + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    kind: Option<EventKind>,
    handler: Handler,
}

struct StoreInner {
    ring: VecDeque<Arc<Event>>,
    capacity: usize,
    subscribers: Vec<Subscriber>,
    next_subscriber: SubscriberId,
    total: u64,
    by_kind: HashMap<EventKind, u64>,
    by_severity: HashMap<Severity, u64>,
    last_timestamp_ms: u64,
}

/// Counts reported by [`EventStore::stats`]. Totals cover every emission
/// since construction, not just the events still retained in the ring.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub by_kind: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
}

/// Append-only bounded ring of [`Event`]s with synchronous fan-out.
///
/// The store owns its events; monitors hold a reference for emission
/// only. Emission assigns a strictly increasing id and a monotonically
/// non-decreasing timestamp, enforces the FIFO cap by discarding the
/// oldest entry, and invokes subscribers in subscription order in the
/// caller's context. A panicking subscriber is logged and skipped; it
/// never interrupts other subscribers or the emitter.
pub struct EventStore {
    inner: Mutex<StoreInner>,
    next_id: AtomicU64,
    disabled: AtomicBool,
    budget: ErrorBudget,
}

impl EventStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                ring: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                subscribers: Vec::new(),
                next_subscriber: 0,
                total: 0,
                by_kind: HashMap::new(),
                by_severity: HashMap::new(),
                last_timestamp_ms: 0,
            }),
            next_id: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            budget: ErrorBudget::default(),
        }
    }

    /// Append an event and fan it out to subscribers. Returns the stored
    /// event, or `None` when the store has self-disabled.
    pub fn emit(&self, draft: EventDraft) -> Option<Arc<Event>> {
        if self.disabled.load(Ordering::Relaxed) {
            return None;
        }

        let (event, handlers) = {
            let mut inner = self.inner.lock().unwrap();

            let timestamp_ms = wall_clock_ms().max(inner.last_timestamp_ms);
            inner.last_timestamp_ms = timestamp_ms;

            let severity = draft
                .severity
                .unwrap_or_else(|| draft.kind.default_severity());
            let event = Arc::new(Event {
                id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
                kind: draft.kind,
                timestamp_ms,
                severity,
                source: draft.source.unwrap_or_else(|| "monitor".to_string()),
                payload: draft.payload,
                stack: draft.stack,
                file: draft.file,
                line: draft.line,
                suggestion: draft.suggestion,
            });

            if inner.ring.len() >= inner.capacity {
                inner.ring.pop_front();
            }
            inner.ring.push_back(event.clone());
            inner.total += 1;
            *inner.by_kind.entry(event.kind).or_insert(0) += 1;
            *inner.by_severity.entry(event.severity).or_insert(0) += 1;

            let handlers: Vec<(SubscriberId, Handler)> = inner
                .subscribers
                .iter()
                .filter(|s| s.kind.map_or(true, |k| k == event.kind))
                .map(|s| (s.id, s.handler.clone()))
                .collect();
            (event, handlers)
        };

        // Subscribers run outside the lock so a handler may query the
        // store (or emit) without deadlocking.
        for (id, handler) in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                tracing::warn!(subscriber = id, event_id = event.id, "event subscriber panicked");
                self.record_internal_error("subscriber");
            }
        }

        Some(event)
    }

    /// Events currently retained, oldest first, restricted by `filter`.
    pub fn events(&self, filter: EventFilter) -> Vec<Arc<Event>> {
        let inner = self.inner.lock().unwrap();
        inner
            .ring
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap();
        StoreStats {
            total: inner.total,
            by_kind: inner
                .by_kind
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            by_severity: inner
                .by_severity
                .iter()
                .map(|(s, v)| (s.as_str().to_string(), *v))
                .collect(),
        }
    }

    /// Register a handler for one kind, or for every kind when `kind` is
    /// `None`. Handlers run synchronously in emission order.
    pub fn subscribe(
        &self,
        kind: Option<EventKind>,
        handler: impl Fn(&Arc<Event>) + Send + Sync + 'static,
    ) -> SubscriberId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(Subscriber {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscriber. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        inner.subscribers.len() != before
    }

    /// Drop all retained events and counters. Testing only; ids keep
    /// increasing so the monotonicity invariant survives a clear.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.ring.clear();
        inner.total = 0;
        inner.by_kind.clear();
        inner.by_severity.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Record an error raised inside the monitor. When the error budget
    /// overflows, the store self-disables: no further events are
    /// accepted and one terminal notice is logged.
    pub(crate) fn record_internal_error(&self, context: &str) {
        if !self.budget.record() {
            self.disabled.store(true, Ordering::Relaxed);
            tracing::error!(
                context,
                "error budget exceeded; monitor disabled itself to protect the host"
            );
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("EventStore")
            .field("len", &inner.ring.len())
            .field("capacity", &inner.capacity)
            .field("total", &inner.total)
            .field("subscribers", &inner.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn draft(kind: EventKind) -> EventDraft {
        EventDraft::new(kind).source("test")
    }

    #[test]
    fn ids_strictly_increase_and_timestamps_never_decrease() {
        let store = EventStore::new();
        let mut last_id = 0;
        let mut last_ts = 0;
        for _ in 0..50 {
            let e = store.emit(draft(EventKind::SystemInfo)).unwrap();
            assert!(e.id > last_id);
            assert!(e.timestamp_ms >= last_ts);
            last_id = e.id;
            last_ts = e.timestamp_ms;
        }
    }

    #[test]
    fn ring_keeps_most_recent_events() {
        let store = EventStore::with_capacity(10);
        for _ in 0..25 {
            store.emit(draft(EventKind::SystemInfo));
        }
        assert_eq!(store.len(), 10);
        let events = store.events(EventFilter::new());
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, (16..=25).collect::<Vec<u64>>());
    }

    #[test]
    fn severity_defaults_and_overrides() {
        let store = EventStore::new();
        let defaulted = store.emit(draft(EventKind::TaskDeadlock)).unwrap();
        assert_eq!(defaulted.severity, Severity::Critical);

        let overridden = store
            .emit(draft(EventKind::SystemInfo).severity(Severity::Critical))
            .unwrap();
        assert_eq!(overridden.severity, Severity::Critical);
    }

    #[test]
    fn filters_by_kind_severity_and_since() {
        let store = EventStore::new();
        store.emit(draft(EventKind::SystemInfo));
        store.emit(draft(EventKind::MemoryLeak));
        store.emit(draft(EventKind::EventLoopStall));

        assert_eq!(
            store
                .events(EventFilter::new().kind(EventKind::MemoryLeak))
                .len(),
            1
        );
        assert_eq!(
            store
                .events(EventFilter::new().severity(Severity::Critical))
                .len(),
            1
        );
        let far_future = wall_clock_ms() + 60_000;
        assert!(store
            .events(EventFilter::new().since_ms(far_future))
            .is_empty());
    }

    #[test]
    fn stats_count_all_emissions() {
        let store = EventStore::with_capacity(2);
        for _ in 0..5 {
            store.emit(draft(EventKind::UnawaitedTask));
        }
        let stats = store.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_kind["unawaited-task"], 5);
        assert_eq!(stats.by_severity["warning"], 5);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn subscribers_run_in_order_and_survive_panics() {
        let store = EventStore::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = calls.clone();
        store.subscribe(None, move |_| c.lock().unwrap().push("first"));
        store.subscribe(None, |_| panic!("subscriber bug"));
        let c = calls.clone();
        store.subscribe(None, move |_| c.lock().unwrap().push("third"));

        let emitted = store.emit(draft(EventKind::SystemInfo));
        assert!(emitted.is_some());
        assert_eq!(*calls.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn kind_scoped_subscription() {
        let store = EventStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.subscribe(Some(EventKind::MemoryLeak), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        store.emit(draft(EventKind::SystemInfo));
        store.emit(draft(EventKind::MemoryLeak));
        store.emit(draft(EventKind::MemoryLeak));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = EventStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = store.subscribe(None, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        store.emit(draft(EventKind::SystemInfo));
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.emit(draft(EventKind::SystemInfo));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_reenter_the_store() {
        let store = Arc::new(EventStore::new());
        let inner = store.clone();
        store.subscribe(Some(EventKind::SystemInfo), move |_| {
            // Queries from inside a handler must not deadlock.
            let _ = inner.stats();
            let _ = inner.events(EventFilter::new());
        });
        assert!(store.emit(draft(EventKind::SystemInfo)).is_some());
    }

    #[test]
    fn clear_resets_contents_but_not_ids() {
        let store = EventStore::new();
        let first = store.emit(draft(EventKind::SystemInfo)).unwrap();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.stats().total, 0);
        let next = store.emit(draft(EventKind::SystemInfo)).unwrap();
        assert!(next.id > first.id);
    }

    #[test]
    fn self_disables_after_error_budget_overflow() {
        let store = EventStore::new();
        for _ in 0..=crate::budget::DEFAULT_MAX_ERRORS {
            store.record_internal_error("test");
        }
        assert!(store.is_disabled());
        assert!(store.emit(draft(EventKind::SystemInfo)).is_none());
    }
}
