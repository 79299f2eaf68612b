//! Handler wrappers.
//!
//! A handler is any `Fn(&str) -> Result<T, E>` taking the raw request line.
//! Each wrapper returns a handler with the same shape, so they nest:
//!
//! ```ignore
//! let handler = traced(tracer, counted(page_counter, basic_page));
//! ```

use crate::metrics::MetricCounter;
use crate::tracer::SpanTracer;
use std::fmt::Display;
use std::sync::Arc;

/// Brackets every call with [`SpanTracer::on_enter`] and [`SpanTracer::on_exit`].
///
/// The handler's result is returned untouched. An `Err` is recorded on the
/// span before it is sealed.
pub fn traced<H, T, E>(tracer: Arc<SpanTracer>, handler: H) -> impl Fn(&str) -> Result<T, E> + Send + Sync
where
    H: Fn(&str) -> Result<T, E> + Send + Sync,
    E: Display,
{
    move |request_line: &str| {
        let scope = tracer.on_enter(request_line);
        let result = handler(request_line);
        tracer.on_exit(scope, result.as_ref().err());
        result
    }
}

/// Counts every call on `counter` before running the handler.
pub fn counted<H, T, E>(counter: Arc<MetricCounter>, handler: H) -> impl Fn(&str) -> Result<T, E> + Send + Sync
where
    H: Fn(&str) -> Result<T, E> + Send + Sync,
{
    move |request_line: &str| {
        counter.record();
        handler(request_line)
    }
}
