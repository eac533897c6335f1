use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sliding-window budget for errors raised inside the monitor itself.
///
/// Once more than `max_errors` land within `window`, the budget trips
/// permanently and the owner is expected to self-disable. This keeps a
/// misbehaving monitor from compounding instability in the host process.
#[derive(Debug)]
pub struct ErrorBudget {
    max_errors: usize,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
    tripped: AtomicBool,
}

pub(crate) const DEFAULT_MAX_ERRORS: usize = 100;
pub(crate) const DEFAULT_ERROR_WINDOW: Duration = Duration::from_secs(60);

impl ErrorBudget {
    pub fn new(max_errors: usize, window: Duration) -> Self {
        Self {
            max_errors,
            window,
            hits: Mutex::new(VecDeque::new()),
            tripped: AtomicBool::new(false),
        }
    }

    /// Record one internal error. Returns `false` exactly once, at the
    /// moment the budget is exceeded; `true` while within budget and on
    /// every call after the trip (the caller already disabled itself).
    pub fn record(&self) -> bool {
        if self.tripped.load(Ordering::Relaxed) {
            return true;
        }
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        hits.push_back(now);
        if hits.len() > self.max_errors {
            self.tripped.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Relaxed)
    }
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ERRORS, DEFAULT_ERROR_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_budget() {
        let budget = ErrorBudget::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(budget.record());
        }
        assert!(!budget.is_tripped());
    }

    #[test]
    fn trips_exactly_once_on_overflow() {
        let budget = ErrorBudget::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(budget.record());
        }
        assert!(!budget.record());
        assert!(budget.is_tripped());
        // After the trip the caller has disabled itself; further records
        // are acknowledged without re-reporting.
        assert!(budget.record());
    }

    #[test]
    fn old_hits_fall_out_of_the_window() {
        let budget = ErrorBudget::new(2, Duration::from_millis(10));
        assert!(budget.record());
        assert!(budget.record());
        std::thread::sleep(Duration::from_millis(20));
        assert!(budget.record());
        assert!(!budget.is_tripped());
    }
}
