use std::time::SystemTime;

use serde::Serialize;
use serde_json::{Map, Value};

/// Classification of a detection surfaced by the monitor.
///
/// The kind determines the default [`Severity`] and the shape of the
/// event payload. String forms (used in dedup keys, metrics labels and
/// the JSON export) are kebab-case, e.g. `event-loop-stall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    EventLoopStall,
    MemoryLeak,
    TaskDeadlock,
    UnawaitedTask,
    CpuBlock,
    HandleLeak,
    AsyncResourceLeak,
    SystemInfo,
}

impl EventKind {
    /// All kinds, in a stable order (used by stats export).
    pub const ALL: [EventKind; 8] = [
        EventKind::EventLoopStall,
        EventKind::MemoryLeak,
        EventKind::TaskDeadlock,
        EventKind::UnawaitedTask,
        EventKind::CpuBlock,
        EventKind::HandleLeak,
        EventKind::AsyncResourceLeak,
        EventKind::SystemInfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::EventLoopStall => "event-loop-stall",
            EventKind::MemoryLeak => "memory-leak",
            EventKind::TaskDeadlock => "task-deadlock",
            EventKind::UnawaitedTask => "unawaited-task",
            EventKind::CpuBlock => "cpu-block",
            EventKind::HandleLeak => "handle-leak",
            EventKind::AsyncResourceLeak => "async-resource-leak",
            EventKind::SystemInfo => "system-info",
        }
    }

    /// Severity assigned when the emitter does not override it.
    pub fn default_severity(self) -> Severity {
        match self {
            EventKind::TaskDeadlock | EventKind::MemoryLeak => Severity::Critical,
            EventKind::EventLoopStall | EventKind::CpuBlock | EventKind::HandleLeak => {
                Severity::Error
            }
            EventKind::UnawaitedTask | EventKind::AsyncResourceLeak => Severity::Warning,
            EventKind::SystemInfo => Severity::Info,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgent a detection is. Ordered: `Info < Warning < Error < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable detection record.
///
/// Events are created by [`EventStore::emit`](crate::EventStore::emit)
/// and travel as `Arc<Event>` from the store through subscribers and the
/// alert router. `id` strictly increases and `timestamp_ms` never
/// decreases within a process lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    pub kind: EventKind,
    pub timestamp_ms: u64,
    pub severity: Severity,
    /// Best-effort originating component or call-site.
    pub source: String,
    /// Kind-specific key/value details.
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Event {
    /// Dedup key used by the alert router: `kind:file:line`.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind,
            self.file.as_deref().unwrap_or("unknown"),
            self.line.unwrap_or(0)
        )
    }
}

/// Builder for an event passed to [`EventStore::emit`](crate::EventStore::emit).
///
/// Only the kind is required; the store fills in id, timestamp and the
/// kind's default severity.
///
/// # Example
///
/// ```ignore
/// store.emit(
///     EventDraft::new(EventKind::MemoryLeak)
///         .payload("growthMB", 12.5)
///         .suggestion("Check for unbounded caches or listener lists"),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub(crate) kind: EventKind,
    pub(crate) severity: Option<Severity>,
    pub(crate) source: Option<String>,
    pub(crate) payload: Map<String, Value>,
    pub(crate) stack: Option<String>,
    pub(crate) file: Option<String>,
    pub(crate) line: Option<u32>,
    pub(crate) suggestion: Option<String>,
}

impl EventDraft {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            severity: None,
            source: None,
            payload: Map::new(),
            stack: None,
            file: None,
            line: None,
            suggestion: None,
        }
    }

    /// Override the kind's default severity.
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Add one payload entry. Later writes win on key collision.
    pub fn payload(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn file_line(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Restriction applied by [`EventStore::events`](crate::EventStore::events).
///
/// All present fields must match: kind equality, severity equality,
/// `timestamp_ms >= since_ms`. An absent field means no restriction.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter {
    pub kind: Option<EventKind>,
    pub severity: Option<Severity>,
    pub since_ms: Option<u64>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn since_ms(mut self, since_ms: u64) -> Self {
        self.since_ms = Some(since_ms);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if event.severity != severity {
                return false;
            }
        }
        if let Some(since) = self.since_ms {
            if event.timestamp_ms < since {
                return false;
            }
        }
        true
    }
}

/// Wall clock in milliseconds since the Unix epoch.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
pub(crate) fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("SystemTime before Unix epoch")
        .as_millis() as u64
}
