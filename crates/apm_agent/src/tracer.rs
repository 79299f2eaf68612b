//! Span lifecycle around request handling.
//!
//! [`SpanTracer::on_enter`] runs before the handler with the raw request line
//! and [`SpanTracer::on_exit`] runs after it with the outcome. Together they
//! form a strict bracket:
//!
//! - the operation name is derived from the request line with query strings
//!   and fragments removed, so all requests to one endpoint share a name;
//! - ignored requests produce no span, and their exit is a no-op;
//! - every opened span is attached as the active span, then detached, sealed
//!   and handed to the [`SpanSink`] exactly once. [`SpanScope`] is consumed
//!   by `on_exit`, and if it is dropped instead (a panicking handler) the drop
//!   closes the span.
//!
//! Most callers use [`crate::middleware::traced`] rather than calling the two
//! hooks by hand.

use crate::context::{self, ContextGuard, SharedSpan};
use crate::span::{Span, SpanData, SpanError, SpanKind};
use crate::wildcard::{any_matches, WildcardMatcher};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Error description recorded when a scope is dropped while unwinding.
pub const PANIC_DESCRIPTION: &str = "handler panicked";

/// Derives a low-cardinality operation name from an HTTP request line.
///
/// The line is cut at the first `" HTTP"` marker, then at the first `?` and
/// the first `#`, so `"GET /nothing?x=1#y HTTP/1.1"` becomes `"GET /nothing"`.
pub fn operation_name(request_line: &str) -> &str {
    let request = match request_line.find(" HTTP") {
        Some(end) => &request_line[..end],
        None => request_line,
    };
    let request = match request.find('?') {
        Some(end) if end > 0 => &request[..end],
        _ => request,
    };
    match request.find('#') {
        Some(end) if end > 0 => &request[..end],
        _ => request,
    }
}

/// Path part of an operation name (`"GET /a"` -> `"/a"`).
fn operation_path(operation: &str) -> &str {
    operation
        .split_once(' ')
        .map_or(operation, |(_, path)| path)
}

/// Receives spans once they are sealed.
pub trait SpanSink: Send + Sync {
    fn on_end(&self, span: SpanData);
}

/// Sink that keeps every finished span in memory, for tests and local debugging.
#[derive(Debug, Default)]
pub struct InMemorySpanSink {
    spans: Mutex<Vec<SpanData>>,
}

impl InMemorySpanSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl SpanSink for InMemorySpanSink {
    fn on_end(&self, span: SpanData) {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span);
    }
}

type IgnorePredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Opens and closes one server span per traced request.
pub struct SpanTracer {
    sink: Arc<dyn SpanSink>,
    ignore: Vec<IgnorePredicate>,
}

impl fmt::Debug for SpanTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanTracer")
            .field("ignore_predicates", &self.ignore.len())
            .finish_non_exhaustive()
    }
}

impl SpanTracer {
    pub fn new(sink: Arc<dyn SpanSink>) -> Self {
        Self {
            sink,
            ignore: Vec::new(),
        }
    }

    /// Skips tracing for operation names the predicate accepts.
    ///
    /// Predicates accumulate: a request is ignored if any of them matches.
    pub fn with_ignore(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.ignore.push(Box::new(predicate));
        self
    }

    /// Skips tracing for request paths matching any wildcard pattern.
    pub fn with_ignore_urls(self, patterns: &[String]) -> Self {
        if patterns.is_empty() {
            return self;
        }
        let matchers: Vec<WildcardMatcher> =
            patterns.iter().map(|p| WildcardMatcher::new(p)).collect();
        self.with_ignore(move |operation| any_matches(&matchers, operation_path(operation)))
    }

    pub fn should_ignore(&self, operation: &str) -> bool {
        self.ignore.iter().any(|predicate| predicate(operation))
    }

    /// Opens a server span for the request and makes it the active span.
    ///
    /// Returns `None` when the request is ignored.
    pub fn on_enter(&self, request_line: &str) -> Option<SpanScope> {
        let operation = operation_name(request_line);
        if self.should_ignore(operation) {
            debug!(operation, "request ignored, no span opened");
            return None;
        }

        let span: SharedSpan = Rc::new(RefCell::new(Span::new(operation, SpanKind::Server)));
        let guard = context::attach(Rc::clone(&span));
        debug!(operation, "span opened");

        Some(SpanScope {
            open: Some(OpenScope {
                span,
                guard,
                sink: Arc::clone(&self.sink),
            }),
        })
    }

    /// Closes the span opened by [`on_enter`](Self::on_enter).
    ///
    /// `None` (an ignored request) is a no-op. A present error marks the span
    /// failed before it is sealed.
    pub fn on_exit<E>(&self, scope: Option<SpanScope>, error: Option<&E>)
    where
        E: fmt::Display + ?Sized,
    {
        if let Some(mut scope) = scope {
            scope.close(error.map(|e| SpanError::new(e.to_string())));
        }
    }
}

/// Handle carried from `on_enter` to `on_exit`.
///
/// Holds the open span and the context guard that keeps it active. `!Send`:
/// it must be closed on the thread that opened it.
#[must_use = "a scope closes its span when dropped; pass it to SpanTracer::on_exit"]
pub struct SpanScope {
    open: Option<OpenScope>,
}

struct OpenScope {
    span: SharedSpan,
    guard: ContextGuard,
    sink: Arc<dyn SpanSink>,
}

impl SpanScope {
    /// Current name of the span this scope will close.
    pub fn name(&self) -> Option<String> {
        self.open
            .as_ref()
            .map(|open| open.span.borrow().name().to_string())
    }

    fn close(&mut self, error: Option<SpanError>) {
        let Some(OpenScope { span, guard, sink }) = self.open.take() else {
            return;
        };

        if let Some(error) = error {
            span.borrow_mut().record_error(error);
        }
        drop(guard);

        // The context stack released its handle with the guard
        let span = match Rc::try_unwrap(span) {
            Ok(cell) => cell.into_inner(),
            Err(shared) => shared.borrow().clone(),
        };
        let data = span.finish();
        debug!(
            operation = %data.name,
            status = ?data.status,
            duration_ms = data.duration_millis(),
            "span closed"
        );
        sink.on_end(data);
    }
}

impl Drop for SpanScope {
    fn drop(&mut self) {
        if self.open.is_some() {
            let error = std::thread::panicking().then(|| SpanError::new(PANIC_DESCRIPTION));
            self.close(error);
        }
    }
}
