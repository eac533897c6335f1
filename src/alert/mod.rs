//! Alert routing: filtering, deduplication, per-route rate limiting and
//! dispatch of events to external sinks.
//!
//! The router is transport-agnostic; a route handler is any closure
//! returning a boxed future. Built-in HTTP sinks live in
//! [`routes`] behind the `webhooks` cargo feature.

mod router;

#[cfg(feature = "webhooks")]
#[cfg_attr(docsrs, doc(cfg(feature = "webhooks")))]
pub mod routes;

pub use router::{AlertRoute, AlertRouter, RateLimit, RouteHandler};
