//! # HTTP middlewares
//! This crate provides the middlewares every server app installs in front of
//! its routes: request tracing, access logging and panic recovery.
//!
//! ## Setup
//! Tracing and logging can be set up using [`setup::setup`]. This should be
//! the first call of any server binary.
//!
//! ## Middlewares
//! All middlewares are [`tower_layer::Layer`]s, so they work with any
//! [`tower`] based http framework like [`axum`](https://docs.rs/axum/latest/axum):
//!
//! - [`middleware::trace::TraceRequestsLayer`] opens a span per request and
//!   correlates it with the caller's trace, see [`http_injector`].
//! - [`middleware::log::LogRequestsLayer`] logs one record per request.
//! - [`middleware::recovery::RecoveryLayer`] turns panics into `500`
//!   responses and reports them through a [`notify::Notifier`].
//!
//! The recovery layer catches panics wherever it is installed. Panicking
//! requests only reach the access log when recovery sits inside the logging
//! layer, otherwise the panic unwinds past the logger before it is caught:
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/foo", get(|| async {}))
//!     .layer(httpx::recovery(Some(notifier), REPORT_CHAT))
//!     .layer(httpx::log_requests())
//!     .layer(httpx::trace_requests("my-service"));
//! ```

use std::sync::Arc;

pub mod callstack;
pub mod http_injector;
pub mod middleware;
pub mod notify;
pub mod setup;

#[cfg(test)]
pub(crate) mod test_support;

use middleware::{log::LogRequestsLayer, recovery::RecoveryLayer, trace::TraceRequestsLayer};
use notify::Notifier;

/// Returns a middleware that traces incoming requests.
pub fn trace_requests(service_name: impl Into<String>) -> TraceRequestsLayer {
    TraceRequestsLayer::new(service_name)
}

/// Returns a middleware that logs every incoming request.
pub fn log_requests() -> LogRequestsLayer {
    LogRequestsLayer
}

/// Returns a middleware that recovers from panics and reports them to
/// `report_chat` through `notifier`.
pub fn recovery(notifier: Option<Arc<dyn Notifier>>, report_chat: i64) -> RecoveryLayer {
    RecoveryLayer::new(notifier, report_chat)
}
