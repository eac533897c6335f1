use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EventLoopConfig;
use crate::event::{EventDraft, EventKind, Severity};
use crate::health::HealthAggregator;
use crate::store::EventStore;

/// How often the probe timer fires to take one delay measurement.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Minimum spacing between stall emissions.
pub(crate) const EMIT_COOLDOWN: Duration = Duration::from_secs(5);

/// Observations the histogram retains between summaries.
const HISTOGRAM_CAPACITY: usize = 10_000;

const MONITOR_NAME: &str = "event-loop";

/// Scheduler-delay observations accumulated since the last summary.
///
/// The probe task records how much longer than requested each short
/// sleep took; that oversleep is the time the scheduler spent unable to
/// run ready work.
#[derive(Debug, Default)]
pub struct DelayHistogram {
    samples: Mutex<Vec<f64>>,
}

impl DelayHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one delay observation in milliseconds.
    pub fn record(&self, delay_ms: f64) {
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            return;
        }
        let mut samples = self.samples.lock().unwrap();
        if samples.len() >= HISTOGRAM_CAPACITY {
            samples.remove(0);
        }
        samples.push(delay_ms);
    }

    /// Summarize and reset. Returns `None` when no samples arrived.
    pub fn drain(&self) -> Option<DelayStats> {
        let mut samples = self.samples.lock().unwrap();
        if samples.is_empty() {
            return None;
        }
        let mut sorted = std::mem::take(&mut *samples);
        drop(samples);
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let mean = sum / count as f64;
        let variance =
            sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        let pick = |k: usize| sorted[(count * k / 100).min(count - 1)];
        Some(DelayStats {
            count,
            min: sorted[0],
            max: sorted[count - 1],
            mean,
            stddev: variance.sqrt(),
            p50: pick(50),
            p95: pick(95),
            p99: pick(99),
        })
    }
}

/// Summary of scheduler delay over one sample interval, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Detects event-loop stalls: sample periods whose mean scheduler delay
/// exceeds the configured threshold.
pub struct EventLoopMonitor {
    config: EventLoopConfig,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    histogram: Arc<DelayHistogram>,
    stall_count: AtomicU64,
    last_emit: Mutex<Option<Instant>>,
}

impl EventLoopMonitor {
    pub fn new(
        config: EventLoopConfig,
        store: Arc<EventStore>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            config,
            store,
            health,
            histogram: Arc::new(DelayHistogram::new()),
            stall_count: AtomicU64::new(0),
            last_emit: Mutex::new(None),
        }
    }

    pub(crate) fn histogram(&self) -> &Arc<DelayHistogram> {
        &self.histogram
    }

    pub fn stall_count(&self) -> u64 {
        self.stall_count.load(Ordering::Relaxed)
    }

    /// Arm the probe and summary tasks.
    pub(crate) fn spawn(self: &Arc<Self>, token: CancellationToken, tasks: &mut JoinSet<()>) {
        let histogram = self.histogram.clone();
        let probe_token = token.clone();
        tasks.spawn(async move {
            loop {
                let started = Instant::now();
                tokio::select! {
                    _ = probe_token.cancelled() => break,
                    _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                }
                let oversleep = started.elapsed().saturating_sub(PROBE_INTERVAL);
                histogram.record(oversleep.as_secs_f64() * 1000.0);
            }
        });

        let monitor = self.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // completes immediately
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => monitor.tick(),
                }
            }
        });
    }

    /// One summary pass: drain the histogram and emit a stall event when
    /// the mean delay crossed the threshold.
    pub(crate) fn tick(&self) {
        self.health.record_monitor_check(MONITOR_NAME, true);
        let Some(stats) = self.histogram.drain() else {
            return;
        };

        let threshold_ms = self.config.stall_threshold.as_secs_f64() * 1000.0;
        if stats.mean <= threshold_ms {
            return;
        }

        let stall_count = self.stall_count.fetch_add(1, Ordering::Relaxed) + 1;

        {
            let mut last_emit = self.last_emit.lock().unwrap();
            if let Some(last) = *last_emit {
                if last.elapsed() < EMIT_COOLDOWN {
                    return;
                }
            }
            *last_emit = Some(Instant::now());
        }

        let severity = if stats.mean > 500.0 {
            Severity::Critical
        } else {
            Severity::Error
        };
        let suggestion = if stats.mean > 1000.0 {
            "Event loop blocked for over a second: look for synchronous I/O or heavy CPU work on the scheduler thread"
        } else if stats.mean > 500.0 {
            "Look for a large synchronous operation or a missing await in a hot path"
        } else {
            "Break long-running synchronous work into smaller chunks or move it off the scheduler thread"
        };

        self.store.emit(
            EventDraft::new(EventKind::EventLoopStall)
                .severity(severity)
                .source("event-loop-monitor")
                .payload("meanMs", stats.mean.round())
                .payload("maxMs", stats.max.round())
                .payload("p95Ms", stats.p95.round())
                .payload("p99Ms", stats.p99.round())
                .payload("samples", stats.count)
                .payload("stallCount", stall_count)
                .suggestion(suggestion),
        );
    }
}

impl std::fmt::Debug for EventLoopMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopMonitor")
            .field("stall_count", &self.stall_count)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFilter;

    fn monitor_with_threshold(threshold_ms: u64) -> (Arc<EventLoopMonitor>, Arc<EventStore>) {
        let store = Arc::new(EventStore::new());
        let health = Arc::new(HealthAggregator::new());
        let config = EventLoopConfig {
            enabled: true,
            sample_interval: Duration::from_secs(1),
            stall_threshold: Duration::from_millis(threshold_ms),
        };
        (
            Arc::new(EventLoopMonitor::new(config, store.clone(), health)),
            store,
        )
    }

    #[test]
    fn histogram_drains_and_resets() {
        let histogram = DelayHistogram::new();
        assert!(histogram.drain().is_none());

        for v in [1.0, 2.0, 3.0, 4.0] {
            histogram.record(v);
        }
        let stats = histogram.drain().unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.mean, 2.5);
        assert!(histogram.drain().is_none());
    }

    #[test]
    fn histogram_rejects_garbage() {
        let histogram = DelayHistogram::new();
        histogram.record(-1.0);
        histogram.record(f64::NAN);
        histogram.record(f64::INFINITY);
        assert!(histogram.drain().is_none());
    }

    #[test]
    fn stall_emitted_when_mean_crosses_threshold() {
        let (monitor, store) = monitor_with_threshold(100);
        for _ in 0..10 {
            monitor.histogram().record(150.0);
        }
        monitor.tick();

        let events = store.events(EventFilter::new().kind(EventKind::EventLoopStall));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.severity, Severity::Error);
        assert!(event.payload["meanMs"].as_f64().unwrap() >= 100.0);
        assert_eq!(event.payload["stallCount"], 1);
        assert!(event.suggestion.is_some());
    }

    #[test]
    fn no_event_below_threshold() {
        let (monitor, store) = monitor_with_threshold(200);
        for _ in 0..10 {
            monitor.histogram().record(50.0);
        }
        monitor.tick();
        assert!(store
            .events(EventFilter::new().kind(EventKind::EventLoopStall))
            .is_empty());
    }

    #[test]
    fn severe_stall_is_critical_with_tiered_hint() {
        let (monitor, store) = monitor_with_threshold(100);
        monitor.histogram().record(1500.0);
        monitor.tick();

        let events = store.events(EventFilter::new().kind(EventKind::EventLoopStall));
        assert_eq!(events[0].severity, Severity::Critical);
        assert!(events[0]
            .suggestion
            .as_deref()
            .unwrap()
            .contains("synchronous I/O or heavy CPU"));
    }

    #[test]
    fn repeat_emissions_are_suppressed_within_cooldown() {
        let (monitor, store) = monitor_with_threshold(100);
        for _ in 0..3 {
            monitor.histogram().record(300.0);
            monitor.tick();
        }
        let events = store.events(EventFilter::new().kind(EventKind::EventLoopStall));
        assert_eq!(events.len(), 1);
        // Stalls kept counting even while emission was suppressed.
        assert_eq!(monitor.stall_count(), 3);
    }

    #[test]
    fn empty_interval_reports_health_only() {
        let (monitor, store) = monitor_with_threshold(100);
        monitor.tick();
        assert!(store.is_empty());
    }
}
