use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Tuning preset selecting how aggressively the monitor samples.
///
/// Presets only choose defaults; any field can be overridden afterwards
/// and user-supplied values win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Low overhead: task tracking and unawaited detection off, 30 s
    /// intervals, 300 ms stall threshold.
    Production,
    /// Moderate: everything on, 10-15 s intervals, 150 ms stall threshold.
    #[default]
    Development,
    /// Aggressive: 5-10 s intervals, 100 ms stall threshold.
    Debug,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Production => "production",
            Mode::Development => "development",
            Mode::Debug => "debug",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "production" => Ok(Mode::Production),
            "development" => Ok(Mode::Development),
            "debug" => Ok(Mode::Debug),
            other => Err(Error::invalid_config(format!("unknown mode '{other}'"))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-loop monitor settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventLoopConfig {
    pub enabled: bool,
    /// How often delay statistics are summarized. Minimum 1 s.
    pub sample_interval: Duration,
    /// Mean scheduler delay above which a stall is reported. Minimum 10 ms.
    pub stall_threshold: Duration,
}

/// Task tracker settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskConfig {
    pub enabled: bool,
    /// Watchdog interval. Minimum 1 s.
    pub check_interval: Duration,
    /// Age at which a pending task becomes a deadlock candidate. Minimum 5 s.
    pub deadlock_threshold: Duration,
    /// Tracked-task cap, 10..=100_000. Oldest non-pending entries are
    /// evicted at the cap.
    pub max_tracked: usize,
}

/// Memory monitor settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Snapshot interval. Minimum 5 s.
    pub check_interval: Duration,
    /// Per-interval heap growth counted toward a leak. Minimum 1 MB,
    /// must be finite.
    pub leak_threshold_mb: f64,
    /// Retained snapshot cap, 3..=1000.
    pub max_snapshots: usize,
    /// Consecutive growth samples required before a leak is reported.
    pub consecutive_growth: u32,
}

/// Unawaited-task detector settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnawaitedConfig {
    pub enabled: bool,
    /// Sweep interval. Minimum 1 s.
    pub check_interval: Duration,
    /// Age past which an unobserved task is reported. Minimum 1 s.
    pub warning_threshold: Duration,
}

/// Full monitor configuration.
///
/// Start from a mode preset and override individual fields; all fields
/// are public, with `with_*` helpers for the common ones:
///
/// ```rust
/// use std::time::Duration;
/// use vigil::{Mode, MonitorConfig};
///
/// let config = MonitorConfig::for_mode(Mode::Production)
///     .with_stall_threshold(Duration::from_millis(250));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub mode: Mode,
    pub event_loop: EventLoopConfig,
    pub tasks: TaskConfig,
    pub memory: MemoryConfig,
    pub unawaited: UnawaitedConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::for_mode(Mode::default())
    }
}

impl MonitorConfig {
    /// Build the defaults for a mode preset.
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Production => Self {
                mode,
                event_loop: EventLoopConfig {
                    enabled: true,
                    sample_interval: Duration::from_secs(30),
                    stall_threshold: Duration::from_millis(300),
                },
                tasks: TaskConfig {
                    enabled: false,
                    check_interval: Duration::from_secs(30),
                    deadlock_threshold: Duration::from_secs(60),
                    max_tracked: 10_000,
                },
                memory: MemoryConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(30),
                    leak_threshold_mb: 50.0,
                    max_snapshots: 100,
                    consecutive_growth: 3,
                },
                unawaited: UnawaitedConfig {
                    enabled: false,
                    check_interval: Duration::from_secs(30),
                    warning_threshold: Duration::from_secs(10),
                },
            },
            Mode::Development => Self {
                mode,
                event_loop: EventLoopConfig {
                    enabled: true,
                    sample_interval: Duration::from_secs(10),
                    stall_threshold: Duration::from_millis(150),
                },
                tasks: TaskConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(15),
                    deadlock_threshold: Duration::from_secs(30),
                    max_tracked: 10_000,
                },
                memory: MemoryConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(10),
                    leak_threshold_mb: 10.0,
                    max_snapshots: 100,
                    consecutive_growth: 3,
                },
                unawaited: UnawaitedConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(15),
                    warning_threshold: Duration::from_secs(5),
                },
            },
            Mode::Debug => Self {
                mode,
                event_loop: EventLoopConfig {
                    enabled: true,
                    sample_interval: Duration::from_secs(5),
                    stall_threshold: Duration::from_millis(100),
                },
                tasks: TaskConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(5),
                    deadlock_threshold: Duration::from_secs(10),
                    max_tracked: 50_000,
                },
                memory: MemoryConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(5),
                    leak_threshold_mb: 5.0,
                    max_snapshots: 200,
                    consecutive_growth: 3,
                },
                unawaited: UnawaitedConfig {
                    enabled: true,
                    check_interval: Duration::from_secs(5),
                    warning_threshold: Duration::from_secs(2),
                },
            },
        }
    }

    pub fn with_event_loop(mut self, event_loop: EventLoopConfig) -> Self {
        self.event_loop = event_loop;
        self
    }

    pub fn with_tasks(mut self, tasks: TaskConfig) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_unawaited(mut self, unawaited: UnawaitedConfig) -> Self {
        self.unawaited = unawaited;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.event_loop.sample_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.event_loop.stall_threshold = threshold;
        self
    }

    pub fn with_deadlock_threshold(mut self, threshold: Duration) -> Self {
        self.tasks.deadlock_threshold = threshold;
        self
    }

    pub fn with_leak_threshold_mb(mut self, mb: f64) -> Self {
        self.memory.leak_threshold_mb = mb;
        self
    }

    pub fn with_warning_threshold(mut self, threshold: Duration) -> Self {
        self.unawaited.warning_threshold = threshold;
        self
    }

    /// Check every field against its declared range. Called by the
    /// orchestrator before any monitor state is constructed; an error
    /// here means nothing was built.
    pub fn validate(&self) -> Result<()> {
        let el = &self.event_loop;
        if el.sample_interval < Duration::from_secs(1) {
            return Err(Error::invalid_config(
                "event_loop.sample_interval must be at least 1s",
            ));
        }
        if el.stall_threshold < Duration::from_millis(10) {
            return Err(Error::invalid_config(
                "event_loop.stall_threshold must be at least 10ms",
            ));
        }

        let tasks = &self.tasks;
        if tasks.check_interval < Duration::from_secs(1) {
            return Err(Error::invalid_config(
                "tasks.check_interval must be at least 1s",
            ));
        }
        if tasks.deadlock_threshold < Duration::from_secs(5) {
            return Err(Error::invalid_config(
                "tasks.deadlock_threshold must be at least 5s",
            ));
        }
        if !(10..=100_000).contains(&tasks.max_tracked) {
            return Err(Error::invalid_config(
                "tasks.max_tracked must be between 10 and 100000",
            ));
        }

        let memory = &self.memory;
        if memory.check_interval < Duration::from_secs(5) {
            return Err(Error::invalid_config(
                "memory.check_interval must be at least 5s",
            ));
        }
        if !memory.leak_threshold_mb.is_finite() || memory.leak_threshold_mb < 1.0 {
            return Err(Error::invalid_config(
                "memory.leak_threshold_mb must be a finite value of at least 1",
            ));
        }
        if !(3..=1000).contains(&memory.max_snapshots) {
            return Err(Error::invalid_config(
                "memory.max_snapshots must be between 3 and 1000",
            ));
        }
        if memory.consecutive_growth == 0 {
            return Err(Error::invalid_config(
                "memory.consecutive_growth must be at least 1",
            ));
        }

        let unawaited = &self.unawaited;
        if unawaited.check_interval < Duration::from_secs(1) {
            return Err(Error::invalid_config(
                "unawaited.check_interval must be at least 1s",
            ));
        }
        if unawaited.warning_threshold < Duration::from_secs(1) {
            return Err(Error::invalid_config(
                "unawaited.warning_threshold must be at least 1s",
            ));
        }

        Ok(())
    }
}
