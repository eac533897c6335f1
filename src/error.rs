use std::sync::Arc;
use std::time::Duration;

/// The single error type for all vigil operations.
///
/// Every fallible vigil API returns `vigil::Result<T>` (alias for
/// `Result<T, vigil::Error>`). Errors from lower layers (IO, HTTP sinks,
/// task joins) are mapped into variants of this enum so callers only need
/// to handle one error type.
///
/// Only construction-time errors ([`InvalidConfig`](Error::InvalidConfig),
/// [`NoRuntime`](Error::NoRuntime)) ever surface to the caller of the
/// lifecycle API; everything that happens inside a running monitor is
/// contained and logged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no tokio runtime available on this thread")]
    NoRuntime,

    #[error("failed to install hooks for '{monitor}': {reason}")]
    HookInstall {
        monitor: &'static str,
        reason: String,
    },

    #[error("timed out after {0:?} waiting for instrumented task")]
    Timeout(Duration),

    #[error("alert sink error: {0}")]
    Sink(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("external error: {0}")]
    External(#[source] Arc<dyn std::error::Error + Send + Sync>),

    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl Error {
    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Wrap an arbitrary error produced by user code or an external sink.
    pub fn external(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::External(Arc::new(e))
    }

    /// Wrap a delivery failure from an alert route handler.
    pub fn sink(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Sink(Arc::new(e))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidConfig(a), Self::InvalidConfig(b)) => a == b,
            (Self::NoRuntime, Self::NoRuntime) => true,
            (
                Self::HookInstall {
                    monitor: m1,
                    reason: r1,
                },
                Self::HookInstall {
                    monitor: m2,
                    reason: r2,
                },
            ) => m1 == m2 && r1 == r2,
            (Self::Timeout(a), Self::Timeout(b)) => a == b,
            (Self::Sink(a), Self::Sink(b)) => Arc::ptr_eq(a, b),
            (Self::External(a), Self::External(b)) => Arc::ptr_eq(a, b),
            (Self::Io(a), Self::Io(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}
