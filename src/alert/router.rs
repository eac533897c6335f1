use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;

use crate::event::Event;
use crate::Result;

/// Window during which two events with the same `kind:file:line` key are
/// considered the same alert.
pub(crate) const DEDUP_TTL: Duration = Duration::from_secs(5 * 60);

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Handler invoked for each event a route accepts. Receives the event by
/// `Arc` so the returned future can own it.
pub type RouteHandler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type RouteFilter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Caps on successful dispatch attempts per sliding window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

impl RateLimit {
    pub fn per_minute(count: u32) -> Self {
        Self {
            per_minute: Some(count),
            per_hour: None,
        }
    }

    pub fn with_per_hour(mut self, count: u32) -> Self {
        self.per_hour = Some(count);
        self
    }
}

/// A named dispatch target with an optional filter and rate limit.
///
/// ```ignore
/// router.add_route(
///     AlertRoute::new("ops-log", |event| {
///         Box::pin(async move {
///             println!("[{}] {}", event.severity, event.kind);
///             Ok(())
///         })
///     })
///     .filter(|event| event.severity >= Severity::Error)
///     .rate_limit(RateLimit::per_minute(10).with_per_hour(100)),
/// );
/// ```
pub struct AlertRoute {
    name: String,
    filter: Option<RouteFilter>,
    handler: RouteHandler,
    enabled: bool,
    rate_limit: Option<RateLimit>,
}

impl AlertRoute {
    pub fn new<H>(name: impl Into<String>, handler: H) -> Self
    where
        H: Fn(Arc<Event>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            filter: None,
            handler: Arc::new(handler),
            enabled: true,
            rate_limit: None,
        }
    }

    /// Only dispatch events for which `filter` returns true.
    pub fn filter(mut self, filter: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    pub fn rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for AlertRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRoute")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("has_filter", &self.filter.is_some())
            .field("rate_limit", &self.rate_limit)
            .finish()
    }
}

struct RouteState {
    route: AlertRoute,
    minute_window: VecDeque<Instant>,
    hour_window: VecDeque<Instant>,
}

impl RouteState {
    /// Atomic check-and-record: trims both windows, refuses when either
    /// cap is reached, records the attempt in both otherwise.
    fn try_acquire(&mut self, now: Instant) -> bool {
        let Some(limit) = self.route.rate_limit else {
            return true;
        };
        while self
            .minute_window
            .front()
            .is_some_and(|t| now.duration_since(*t) > MINUTE)
        {
            self.minute_window.pop_front();
        }
        while self
            .hour_window
            .front()
            .is_some_and(|t| now.duration_since(*t) > HOUR)
        {
            self.hour_window.pop_front();
        }

        if let Some(cap) = limit.per_minute {
            if self.minute_window.len() >= cap as usize {
                return false;
            }
        }
        if let Some(cap) = limit.per_hour {
            if self.hour_window.len() >= cap as usize {
                return false;
            }
        }
        self.minute_window.push_back(now);
        self.hour_window.push_back(now);
        true
    }
}

struct RouterInner {
    routes: Vec<RouteState>,
    dedup: HashMap<String, Instant>,
}

/// Dispatches events to routes in insertion order, with per-event-key
/// deduplication and per-route rate limiting.
///
/// Handlers are awaited one at a time within the dispatch of a single
/// event; dispatches of different events are independent. A failing
/// handler is logged and the remaining routes still run.
pub struct AlertRouter {
    inner: Mutex<RouterInner>,
}

impl AlertRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                routes: Vec::new(),
                dedup: HashMap::new(),
            }),
        }
    }

    pub fn add_route(&self, route: AlertRoute) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.push(RouteState {
            route,
            minute_window: VecDeque::new(),
            hour_window: VecDeque::new(),
        });
    }

    /// Remove a route by name. Returns whether it existed.
    pub fn remove_route(&self, name: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.routes.len();
        inner.routes.retain(|state| state.route.name != name);
        inner.routes.len() != before
    }

    pub fn route_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .routes
            .iter()
            .map(|state| state.route.name.clone())
            .collect()
    }

    /// Dispatch one event through every matching route.
    pub async fn route(&self, event: &Arc<Event>) {
        let key = event.dedup_key();
        let now = Instant::now();

        // Decide under the lock: dedup, filters, rate limits. Handler
        // futures run after the lock is released.
        let accepted: Vec<(String, RouteHandler)> = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .dedup
                .retain(|_, dispatched| now.duration_since(*dispatched) < DEDUP_TTL);
            if inner.dedup.contains_key(&key) {
                return;
            }

            inner
                .routes
                .iter_mut()
                .filter(|state| state.route.enabled)
                .filter(|state| {
                    state
                        .route
                        .filter
                        .as_ref()
                        .map_or(true, |filter| filter(event))
                })
                .filter_map(|state| {
                    if state.try_acquire(now) {
                        Some((state.route.name.clone(), state.route.handler.clone()))
                    } else {
                        tracing::warn!(
                            route = %state.route.name,
                            event_key = %key,
                            "alert route rate limit exceeded, dropping dispatch"
                        );
                        None
                    }
                })
                .collect()
        };

        let mut delivered = false;
        for (name, handler) in accepted {
            match handler(event.clone()).await {
                Ok(()) => delivered = true,
                Err(error) => {
                    tracing::warn!(route = %name, %error, "alert route handler failed");
                }
            }
        }

        if delivered {
            let mut inner = self.inner.lock().unwrap();
            inner.dedup.insert(key, now);
        }
    }
}

impl Default for AlertRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AlertRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("AlertRouter")
            .field("routes", &inner.routes.len())
            .field("dedup_entries", &inner.dedup.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Map;

    use super::*;
    use crate::event::{EventKind, Severity};

    fn event(kind: EventKind, file: &str, line: u32) -> Arc<Event> {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        Arc::new(Event {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed) as u64,
            kind,
            timestamp_ms: 0,
            severity: kind.default_severity(),
            source: "test".into(),
            payload: Map::new(),
            stack: None,
            file: Some(file.to_string()),
            line: Some(line),
            suggestion: None,
        })
    }

    fn counting_route(name: &str, hits: Arc<AtomicUsize>) -> AlertRoute {
        AlertRoute::new(name, move |_event| {
            let hits = hits.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn duplicate_keys_dispatch_once() {
        let router = AlertRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(counting_route("counter", hits.clone()));

        for _ in 0..10 {
            router
                .route(&event(EventKind::EventLoopStall, "app.rs", 5))
                .await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_each_dispatch() {
        let router = AlertRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(counting_route("counter", hits.clone()));

        for line in 0..5 {
            router
                .route(&event(EventKind::EventLoopStall, "app.rs", line))
                .await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn per_minute_rate_limit_caps_dispatches() {
        let router = AlertRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(
            counting_route("limited", hits.clone())
                .rate_limit(RateLimit::per_minute(2).with_per_hour(5)),
        );

        for line in 0..10 {
            router
                .route(&event(EventKind::TaskDeadlock, "app.rs", line))
                .await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filter_skips_non_matching_events() {
        let router = AlertRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(
            counting_route("critical-only", hits.clone())
                .filter(|event| event.severity == Severity::Critical),
        );

        router
            .route(&event(EventKind::SystemInfo, "a.rs", 1))
            .await;
        router
            .route(&event(EventKind::TaskDeadlock, "a.rs", 2))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_routes_are_skipped() {
        let router = AlertRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(counting_route("off", hits.clone()).enabled(false));

        router
            .route(&event(EventKind::MemoryLeak, "a.rs", 1))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_abort_later_routes() {
        let router = AlertRouter::new();
        router.add_route(AlertRoute::new("broken", |_event| {
            Box::pin(async {
                Err(crate::Error::sink(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "sink down",
                )))
            })
        }));
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(counting_route("working", hits.clone()));

        router
            .route(&event(EventKind::MemoryLeak, "a.rs", 1))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_does_not_mark_the_dedup_key() {
        let router = AlertRouter::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        router.add_route(AlertRoute::new("flaky", move |_event| {
            let a = a.clone();
            Box::pin(async move {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(crate::Error::sink(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "first try fails",
                    )))
                } else {
                    Ok(())
                }
            })
        }));

        router.route(&event(EventKind::HandleLeak, "a.rs", 9)).await;
        router.route(&event(EventKind::HandleLeak, "a.rs", 9)).await;
        router.route(&event(EventKind::HandleLeak, "a.rs", 9)).await;
        // First attempt failed (no dedup entry), second succeeded and
        // recorded the key, third was deduplicated.
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn remove_route_by_name() {
        let router = AlertRouter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        router.add_route(counting_route("gone", hits.clone()));
        assert_eq!(router.route_names(), vec!["gone".to_string()]);

        assert!(router.remove_route("gone"));
        assert!(!router.remove_route("gone"));
        router
            .route(&event(EventKind::MemoryLeak, "a.rs", 1))
            .await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn routes_run_in_insertion_order() {
        let router = AlertRouter::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = order.clone();
            router.add_route(AlertRoute::new(name, move |_event| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                })
            }));
        }

        router
            .route(&event(EventKind::MemoryLeak, "a.rs", 1))
            .await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
