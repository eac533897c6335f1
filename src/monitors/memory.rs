use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::MemoryConfig;
use crate::event::{wall_clock_ms, EventDraft, EventKind, Severity};
use crate::health::HealthAggregator;
use crate::store::EventStore;

const MONITOR_NAME: &str = "memory";
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cumulative growth above which a leak report escalates to critical.
const CRITICAL_TOTAL_GROWTH_MB: f64 = 100.0;

/// One reading of process memory, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReading {
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub rss: u64,
}

/// Source of memory readings. The production implementation is
/// [`SysinfoReader`]; tests inject a scripted reader.
pub trait MemoryReader: Send + Sync {
    fn read(&self) -> MemoryReading;

    /// Ask the runtime to collect garbage. Returns whether the runtime
    /// supported the request; the default is `false` (Rust has no
    /// collector to invoke).
    fn force_gc(&self) -> bool {
        false
    }
}

/// Reads this process's memory via `sysinfo`.
///
/// Resident-set size stands in for heap-used and virtual size for
/// heap-total: the portable equivalents of allocator statistics.
pub struct SysinfoReader {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoReader {
    pub fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReader for SysinfoReader {
    fn read(&self) -> MemoryReading {
        let mut system = self.system.lock().unwrap();
        system.refresh_process_specifics(self.pid, ProcessRefreshKind::new().with_memory());
        match system.process(self.pid) {
            Some(process) => MemoryReading {
                heap_used: process.memory(),
                heap_total: process.virtual_memory(),
                external: 0,
                rss: process.memory(),
            },
            None => MemoryReading::default(),
        }
    }
}

/// A point-in-time memory capture retained by the monitor.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub timestamp_ms: u64,
    pub heap_used: u64,
    pub heap_total: u64,
    pub external: u64,
    pub rss: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: VecDeque<MemorySnapshot>,
    consecutive_growth: u32,
    leak_count: u64,
}

/// Detects sustained heap growth across consecutive snapshots.
pub struct MemoryMonitor {
    config: MemoryConfig,
    store: Arc<EventStore>,
    health: Arc<HealthAggregator>,
    reader: Arc<dyn MemoryReader>,
    state: Mutex<MemoryState>,
}

impl MemoryMonitor {
    pub fn new(
        config: MemoryConfig,
        store: Arc<EventStore>,
        health: Arc<HealthAggregator>,
        reader: Arc<dyn MemoryReader>,
    ) -> Self {
        Self {
            config,
            store,
            health,
            reader,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Retained snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<MemorySnapshot> {
        self.state.lock().unwrap().snapshots.iter().copied().collect()
    }

    /// Heap-used of the latest snapshot, or a fresh reading when no
    /// snapshot exists yet (used by the health roll-up).
    pub fn current_heap_used(&self) -> u64 {
        if let Some(last) = self.state.lock().unwrap().snapshots.back() {
            return last.heap_used;
        }
        self.reader.read().heap_used
    }

    pub fn force_gc(&self) -> bool {
        self.reader.force_gc()
    }

    pub(crate) fn spawn(self: &Arc<Self>, token: CancellationToken, tasks: &mut JoinSet<()>) {
        let monitor = self.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.check_interval);
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

    /// One capture pass: snapshot, classify growth, emit when growth has
    /// been sustained.
    pub(crate) fn tick(&self) {
        let reading = self.reader.read();
        let snapshot = MemorySnapshot {
            timestamp_ms: wall_clock_ms(),
            heap_used: reading.heap_used,
            heap_total: reading.heap_total,
            external: reading.external,
            rss: reading.rss,
        };

        let emission = {
            let mut state = self.state.lock().unwrap();
            let previous = state.snapshots.back().copied();

            if state.snapshots.len() >= self.config.max_snapshots {
                state.snapshots.pop_front();
            }
            state.snapshots.push_back(snapshot);

            let Some(previous) = previous else {
                self.health.record_monitor_check(MONITOR_NAME, true);
                return;
            };

            let growth_bytes = snapshot.heap_used as i64 - previous.heap_used as i64;
            let threshold_bytes = (self.config.leak_threshold_mb * BYTES_PER_MB) as i64;

            if growth_bytes > threshold_bytes {
                state.consecutive_growth += 1;
            } else if growth_bytes < 0 {
                state.consecutive_growth = 0;
            }

            if state.consecutive_growth >= self.config.consecutive_growth {
                // Reset so the next emission requires a fresh run of
                // consecutive growth samples.
                state.consecutive_growth = 0;
                state.leak_count += 1;

                let first = state.snapshots.front().copied().unwrap_or(snapshot);
                let total_growth_mb =
                    (snapshot.heap_used as i64 - first.heap_used as i64) as f64 / BYTES_PER_MB;
                Some((
                    growth_bytes as f64 / BYTES_PER_MB,
                    total_growth_mb,
                    snapshot.heap_used as f64 / BYTES_PER_MB,
                    trend(&state.snapshots),
                    state.leak_count,
                ))
            } else {
                None
            }
        };

        self.health.record_monitor_check(MONITOR_NAME, true);

        if let Some((growth_mb, total_growth_mb, heap_used_mb, trend, leak_count)) = emission {
            let severity = if total_growth_mb > CRITICAL_TOTAL_GROWTH_MB {
                Severity::Critical
            } else {
                Severity::Error
            };
            self.store.emit(
                EventDraft::new(EventKind::MemoryLeak)
                    .severity(severity)
                    .source("memory-monitor")
                    .payload("growthMB", round2(growth_mb))
                    .payload("totalGrowthMB", round2(total_growth_mb))
                    .payload("heapUsedMB", round2(heap_used_mb))
                    .payload("trend", trend)
                    .payload("leakCount", leak_count)
                    .suggestion(
                        "Check for unbounded caches, growing collections, or listeners \
                         that are registered but never removed",
                    ),
            );
        }
    }
}

/// Direction of heap movement over the most recent five snapshots.
fn trend(snapshots: &VecDeque<MemorySnapshot>) -> &'static str {
    let start = snapshots.len().saturating_sub(5);
    let recent: Vec<&MemorySnapshot> = snapshots.iter().skip(start).collect();
    if recent.len() < 2 {
        return "stable";
    }
    let increases = recent
        .windows(2)
        .filter(|pair| pair[1].heap_used > pair[0].heap_used)
        .count();
    if increases >= 4 {
        "growing"
    } else if increases <= 1 {
        "decreasing"
    } else {
        "stable"
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl std::fmt::Debug for MemoryMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("MemoryMonitor")
            .field("snapshots", &state.snapshots.len())
            .field("consecutive_growth", &state.consecutive_growth)
            .field("leak_count", &state.leak_count)
            .finish()
    }
}
