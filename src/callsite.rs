use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::Location;

/// Originating file and line of an instrumented task, captured at the
/// construction boundary via `#[track_caller]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    /// Capture the caller's location.
    #[track_caller]
    pub fn capture() -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
        }
    }

    /// Build a call-site from explicit coordinates (framework glue, tests).
    pub fn at(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// Whether this call-site lives inside vigil's own implementation.
    ///
    /// Tasks created here must never be tracked: the monitor's intervals
    /// and bridge tasks would otherwise observe themselves.
    pub fn is_internal(&self) -> bool {
        is_monitor_path(self.file)
    }
}

impl std::fmt::Display for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Path substrings identifying vigil's own source files. Checked against
/// call-site paths both for the in-repo layout (`src/...`) and for the
/// vendored layout (`vigil-x.y.z/src/...`).
const SELF_PATH_MARKERS: &[&str] = &[
    "vigil/src/",
    "vigil-core",
    "src/monitor.rs",
    "src/monitors/",
    "src/store.rs",
    "src/tracked.rs",
    "src/alert/",
    "src/registry.rs",
    "event_loop.rs",
    "task_tracker.rs",
    "unawaited.rs",
];

/// True when `path` points into the monitor's own implementation.
pub fn is_monitor_path(path: &str) -> bool {
    if path.contains('\\') {
        let normalized = path.replace('\\', "/");
        return SELF_PATH_MARKERS.iter().any(|m| normalized.contains(m));
    }
    SELF_PATH_MARKERS.iter().any(|m| path.contains(m))
}

/// Frames that carry no information for the user: runtime plumbing and
/// the monitor itself.
const NOISE_FRAME_MARKERS: &[&str] = &[
    "vigil::",
    "std::",
    "core::",
    "alloc::",
    "tokio::",
    "futures_util::",
    "backtrace::",
    "__rust_begin_short_backtrace",
];

/// Capture the current stack as text, if backtraces are enabled for this
/// process (`RUST_BACKTRACE`). Returns `None` when disabled so callers
/// can skip the allocation entirely.
pub(crate) fn capture_stack() -> Option<String> {
    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

/// Reduce a raw backtrace to user frames only, keeping at most `limit`
/// frame lines. Location lines (`at src/...`) belonging to kept frames
/// are preserved.
pub(crate) fn clean_stack(raw: &str, limit: usize) -> String {
    let mut kept = Vec::new();
    let mut frames = 0usize;
    let mut keep_location = false;

    for line in raw.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("at ") {
            if keep_location {
                kept.push(line);
            }
            continue;
        }

        keep_location = false;
        if frames >= limit {
            continue;
        }
        let noisy = NOISE_FRAME_MARKERS.iter().any(|m| line.contains(m))
            || is_monitor_path(line);
        if noisy {
            continue;
        }
        kept.push(line);
        frames += 1;
        keep_location = true;
    }

    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_reports_this_file() {
        let site = CallSite::capture();
        assert!(site.file.ends_with("callsite.rs"));
        assert!(site.line > 0);
    }

    #[test]
    fn monitor_paths_are_internal() {
        assert!(is_monitor_path("src/monitors/event_loop.rs"));
        assert!(is_monitor_path(
            "/home/u/.cargo/registry/vigil-0.1.0/vigil/src/tracked.rs"
        ));
        assert!(is_monitor_path("src\\monitors\\task_tracker.rs"));
        assert!(!is_monitor_path("src/main.rs"));
        assert!(!is_monitor_path("examples/app.rs"));
    }

    #[test]
    fn explicit_callsite_filtering() {
        assert!(CallSite::at("src/monitors/unawaited.rs", 10).is_internal());
        assert!(!CallSite::at("src/bin/server.rs", 10).is_internal());
    }

    #[test]
    fn clean_stack_drops_runtime_frames_and_caps_length() {
        let raw = "\
   0: vigil::tracked::Tracked<F>::poll
             at src/tracked.rs:80:13
   1: my_app::fetch_user
             at src/handlers.rs:41:9
   2: tokio::runtime::task::raw::poll
             at /tokio/src/runtime/task/raw.rs:77:5
   3: my_app::main
             at src/main.rs:12:5";

        let cleaned = clean_stack(raw, 10);
        assert!(cleaned.contains("my_app::fetch_user"));
        assert!(cleaned.contains("src/handlers.rs:41"));
        assert!(cleaned.contains("my_app::main"));
        assert!(!cleaned.contains("vigil::"));
        assert!(!cleaned.contains("tokio::"));

        let one = clean_stack(raw, 1);
        assert!(one.contains("fetch_user"));
        assert!(!one.contains("main"));
    }
}
