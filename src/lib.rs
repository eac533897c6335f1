#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Vigil
//!
//! An in-process runtime health monitor for Tokio applications.
//!
//! Vigil watches the runtime it lives in and reports four classes of
//! latent bug as structured events: event-loop stalls (long synchronous
//! work starving the scheduler), task deadlocks (long-pending or
//! circularly-waiting tasks), memory leaks (sustained heap growth), and
//! unawaited tasks (futures whose completion is never observed). Every
//! detection carries the originating call-site and a remediation hint.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vigil::{HealthMonitor, MonitorConfig, Mode};
//!
//! #[tokio::main]
//! async fn main() -> vigil::Result {
//!     let monitor = Arc::new(HealthMonitor::new(MonitorConfig::for_mode(Mode::Development))?);
//!     monitor.start()?;
//!
//!     // Instrument the tasks you care about:
//!     let _users = monitor.tracked(fetch_users()).await;
//!
//!     // React to detections:
//!     monitor.on(None, |event| {
//!         eprintln!("[{}] {}: {:?}", event.severity, event.kind, event.payload);
//!     });
//!
//!     monitor.stop().await;
//!     Ok(())
//! }
//! # async fn fetch_users() -> Vec<String> { Vec::new() }
//! ```
//!
//! ## Core Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`HealthMonitor`] | Orchestrator: lifecycle, queries, instrumentation |
//! | [`MonitorConfig`] | Validated configuration with [`Mode`] presets |
//! | [`EventStore`] | Bounded ring of [`Event`]s with synchronous fan-out |
//! | [`Event`] | One detection: kind, severity, call-site, payload, hint |
//! | [`AlertRouter`](alert::AlertRouter) | Filtered, deduplicated, rate-limited dispatch |
//! | [`MetricsRegistry`] | Counters / gauges / histograms with text export |
//! | [`HealthAggregator`] | Per-monitor health and overall status roll-up |
//! | [`Tracked`] / [`Watched`] | Instrumented futures reporting their lifecycle |
//!
//! ## Instrumentation Boundary
//!
//! Vigil never patches the runtime. Tasks are observed through wrapper
//! futures built at a typed boundary: [`HealthMonitor::tracked`]
//! registers a task with the deadlock tracker, [`HealthMonitor::watch`]
//! with the unawaited-task detector. Both capture the caller's
//! file/line via `#[track_caller]`, and both refuse call-sites inside
//! vigil's own source so the monitor never observes itself.
//!
//! ## Overhead Discipline
//!
//! The monitor runs on the host runtime and keeps its own footprint
//! bounded: the event ring, tracked-task map, snapshot history and
//! histogram series all have hard caps, and an error budget disables
//! the monitor entirely if its own failures exceed 100 in a minute.
//!
//! ## Features
//!
//! - **`webhooks`** - built-in HTTP alert sinks ([`alert::routes`]):
//!   generic webhook, chat-channel webhook, incident-system webhook.

mod budget;
mod callsite;
mod config;
mod error;
mod event;
mod health;
mod metrics;
mod monitor;
mod store;
mod tracked;

pub mod alert;
pub mod monitors;
pub mod registry;

pub use callsite::CallSite;
pub use config::{EventLoopConfig, MemoryConfig, Mode, MonitorConfig, TaskConfig, UnawaitedConfig};
pub use error::Error;
pub use event::{Event, EventDraft, EventFilter, EventKind, Severity};
pub use health::{HealthAggregator, HealthReport, MonitorHealth, OverallStatus};
pub use metrics::{HistogramStats, MetricEntry, MetricsRegistry};
pub use monitor::{HealthMonitor, StatusReport};
pub use store::{EventStore, StoreStats, SubscriberId};
pub use tracked::{TaskId, Tracked, WatchId, Watched};

/// Convenience alias for `Result<T, vigil::Error>`.
pub type Result<T = ()> = std::result::Result<T, Error>;
