//! Optional process-wide handle cache.
//!
//! The monitor itself is an explicit handle ([`HealthMonitor`]) passed
//! into collaborators; nothing in the crate requires this registry. It
//! exists for hosts that want one shared instance without threading the
//! handle through every layer.

use std::sync::{Arc, Mutex};

use crate::config::MonitorConfig;
use crate::monitor::HealthMonitor;
use crate::Result;

static GLOBAL: Mutex<Option<Arc<HealthMonitor>>> = Mutex::new(None);

/// Return the cached instance, constructing (but not starting) one from
/// `config` when none exists. The config of an already-cached instance
/// wins; `config` is then ignored.
pub fn get_or_create(config: MonitorConfig) -> Result<Arc<HealthMonitor>> {
    let mut slot = GLOBAL.lock().unwrap();
    if let Some(existing) = slot.as_ref() {
        return Ok(existing.clone());
    }
    let monitor = Arc::new(HealthMonitor::new(config)?);
    *slot = Some(monitor.clone());
    Ok(monitor)
}

/// The cached instance, if any.
pub fn global() -> Option<Arc<HealthMonitor>> {
    GLOBAL.lock().unwrap().clone()
}

/// Replace the cached instance with a freshly constructed one. The
/// previous instance is stopped first so two monitors never observe the
/// process at once.
pub async fn install(config: MonitorConfig) -> Result<Arc<HealthMonitor>> {
    let previous = GLOBAL.lock().unwrap().take();
    if let Some(previous) = previous {
        previous.stop().await;
    }
    let monitor = Arc::new(HealthMonitor::new(config)?);
    *GLOBAL.lock().unwrap() = Some(monitor.clone());
    Ok(monitor)
}

/// Drop the cached handle (testing). Does not stop the instance.
pub fn clear() {
    GLOBAL.lock().unwrap().take();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    // All registry assertions live in one test: the cache is process
    // state and parallel tests would race on it.
    #[tokio::test]
    async fn cache_get_install_and_clear() {
        clear();

        let config = MonitorConfig::for_mode(Mode::Production);
        let first = get_or_create(config.clone()).unwrap();
        let second = get_or_create(MonitorConfig::for_mode(Mode::Debug)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().mode, Mode::Production);
        assert!(global().is_some());

        first.start().unwrap();
        let replacement = install(MonitorConfig::for_mode(Mode::Debug)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &replacement));
        // The previous instance was stopped before the replacement took
        // its place.
        assert!(!first.is_running());
        assert_eq!(replacement.config().mode, Mode::Debug);

        clear();
        assert!(global().is_none());

        let invalid = {
            let mut c = MonitorConfig::default();
            c.tasks.max_tracked = 1;
            c
        };
        assert!(get_or_create(invalid).is_err());
        assert!(global().is_none());

        clear();
    }
}
