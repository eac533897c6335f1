use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::event::wall_clock_ms;

const DEGRADED_ERRORS: u32 = 3;
const UNHEALTHY_ERRORS: u32 = 10;
const DEGRADED_HEAP_BYTES: u64 = 100 * 1024 * 1024;
const UNHEALTHY_HEAP_BYTES: u64 = 200 * 1024 * 1024;

/// Overall monitor health, worst applicable state wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Self-reported state of one monitor.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MonitorHealth {
    pub healthy: bool,
    pub last_check_ms: u64,
    pub consecutive_errors: u32,
}

/// Roll-up returned by [`HealthAggregator::report`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub uptime_ms: u64,
    pub events_observed: u64,
    pub monitors: BTreeMap<String, MonitorHealth>,
}

/// Tracks per-monitor check results and derives an overall status.
///
/// Monitors call [`record_monitor_check`](Self::record_monitor_check)
/// after every watchdog pass; a failed check increments the monitor's
/// consecutive-error count, a successful one resets it.
pub struct HealthAggregator {
    started: Instant,
    events_observed: AtomicU64,
    monitors: Mutex<BTreeMap<String, MonitorHealth>>,
}

impl HealthAggregator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            events_observed: AtomicU64::new(0),
            monitors: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_monitor_check(&self, name: &str, ok: bool) {
        let mut monitors = self.monitors.lock().unwrap();
        let entry = monitors.entry(name.to_string()).or_insert(MonitorHealth {
            healthy: true,
            last_check_ms: 0,
            consecutive_errors: 0,
        });
        entry.last_check_ms = wall_clock_ms();
        if ok {
            entry.consecutive_errors = 0;
            entry.healthy = true;
        } else {
            entry.consecutive_errors += 1;
            entry.healthy = entry.consecutive_errors <= DEGRADED_ERRORS;
        }
    }

    /// Count one observed event (wired to the event store by the
    /// orchestrator).
    pub fn record_event(&self) {
        self.events_observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Derive overall status from monitor errors and current heap use.
    pub fn overall(&self, heap_used_bytes: u64) -> OverallStatus {
        let monitors = self.monitors.lock().unwrap();
        let mut status = OverallStatus::Healthy;
        for health in monitors.values() {
            if health.consecutive_errors > UNHEALTHY_ERRORS {
                return OverallStatus::Unhealthy;
            }
            if health.consecutive_errors > DEGRADED_ERRORS {
                status = status.max(OverallStatus::Degraded);
            }
        }
        if heap_used_bytes > UNHEALTHY_HEAP_BYTES {
            return OverallStatus::Unhealthy;
        }
        if heap_used_bytes > DEGRADED_HEAP_BYTES {
            status = status.max(OverallStatus::Degraded);
        }
        status
    }

    pub fn report(&self, heap_used_bytes: u64) -> HealthReport {
        HealthReport {
            status: self.overall(heap_used_bytes),
            uptime_ms: self.uptime_ms(),
            events_observed: self.events_observed.load(Ordering::Relaxed),
            monitors: self.monitors.lock().unwrap().clone(),
        }
    }

    /// Text exposition in the same format as the metrics registry, with
    /// one `{monitor="..."}` series per monitor.
    pub fn to_text(&self, heap_used_bytes: u64) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP vigil_monitor_healthy vigil_monitor_healthy");
        let _ = writeln!(out, "# TYPE vigil_monitor_healthy gauge");
        let monitors = self.monitors.lock().unwrap();
        for (name, health) in monitors.iter() {
            let _ = writeln!(
                out,
                "vigil_monitor_healthy{{monitor=\"{name}\"}} {}",
                u8::from(health.healthy)
            );
        }
        let _ = writeln!(
            out,
            "# HELP vigil_monitor_consecutive_errors vigil_monitor_consecutive_errors"
        );
        let _ = writeln!(out, "# TYPE vigil_monitor_consecutive_errors gauge");
        for (name, health) in monitors.iter() {
            let _ = writeln!(
                out,
                "vigil_monitor_consecutive_errors{{monitor=\"{name}\"}} {}",
                health.consecutive_errors
            );
        }
        drop(monitors);

        let _ = writeln!(out, "# HELP vigil_uptime_ms vigil_uptime_ms");
        let _ = writeln!(out, "# TYPE vigil_uptime_ms gauge");
        let _ = writeln!(out, "vigil_uptime_ms {}", self.uptime_ms());

        let _ = writeln!(out, "# HELP vigil_events_observed_total vigil_events_observed_total");
        let _ = writeln!(out, "# TYPE vigil_events_observed_total counter");
        let _ = writeln!(
            out,
            "vigil_events_observed_total {}",
            self.events_observed.load(Ordering::Relaxed)
        );

        let _ = writeln!(out, "# HELP vigil_status vigil_status");
        let _ = writeln!(out, "# TYPE vigil_status gauge");
        let _ = writeln!(
            out,
            "vigil_status{{state=\"{}\"}} 1",
            self.overall(heap_used_bytes)
        );
        out
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("monitors", &self.monitors.lock().unwrap().len())
            .field("events_observed", &self.events_observed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_by_default() {
        let health = HealthAggregator::new();
        assert_eq!(health.overall(0), OverallStatus::Healthy);
    }

    #[test]
    fn ok_check_resets_error_run() {
        let health = HealthAggregator::new();
        for _ in 0..5 {
            health.record_monitor_check("memory", false);
        }
        assert_eq!(health.overall(0), OverallStatus::Degraded);
        health.record_monitor_check("memory", true);
        assert_eq!(health.overall(0), OverallStatus::Healthy);
    }

    #[test]
    fn error_runs_escalate() {
        let health = HealthAggregator::new();
        for _ in 0..4 {
            health.record_monitor_check("task-tracker", false);
        }
        assert_eq!(health.overall(0), OverallStatus::Degraded);
        for _ in 0..7 {
            health.record_monitor_check("task-tracker", false);
        }
        assert_eq!(health.overall(0), OverallStatus::Unhealthy);
    }

    #[test]
    fn heap_pressure_downgrades() {
        let health = HealthAggregator::new();
        assert_eq!(
            health.overall(150 * 1024 * 1024),
            OverallStatus::Degraded
        );
        assert_eq!(
            health.overall(250 * 1024 * 1024),
            OverallStatus::Unhealthy
        );
    }

    #[test]
    fn report_includes_monitor_entries() {
        let health = HealthAggregator::new();
        health.record_monitor_check("event-loop", true);
        health.record_event();
        health.record_event();

        let report = health.report(0);
        assert_eq!(report.status, OverallStatus::Healthy);
        assert_eq!(report.events_observed, 2);
        let entry = &report.monitors["event-loop"];
        assert!(entry.healthy);
        assert!(entry.last_check_ms > 0);
        assert_eq!(entry.consecutive_errors, 0);
    }

    #[test]
    fn text_export_labels_monitors() {
        let health = HealthAggregator::new();
        health.record_monitor_check("task-tracker", true);
        let text = health.to_text(0);
        assert!(text.contains("vigil_monitor_healthy{monitor=\"task-tracker\"} 1"));
        assert!(text.contains("# TYPE vigil_monitor_healthy gauge"));
        assert!(text.contains("vigil_status{state=\"healthy\"} 1"));
        assert!(text.ends_with('\n'));
    }
}
