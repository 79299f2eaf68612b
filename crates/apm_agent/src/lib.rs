//! Request tracing agent
//!
//! Brackets request handlers with server spans, counts page hits, and reports
//! both to an APM intake as NDJSON. The pieces:
//!
//! - [`SpanTracer`] opens a span per request line and closes it exactly once,
//!   even when the handler fails or panics. [`middleware::traced`] wires it
//!   around a handler function.
//! - [`MetricCounter`] registers itself with a [`MetricRegistry`] on first use.
//! - [`Reporter`] drains finished spans and periodic counter snapshots into a
//!   [`TelemetryExporter`] on a background task.
//! - [`Lifecycle`] is the forward-only state machine both servers share.
//!
//! Handlers are synchronous, so the active span lives in thread-local context
//! for the whole call (see [`context`]).

pub mod config;
pub mod context;
pub mod exporter;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod reporter;
pub mod retry;
pub mod span;
pub mod tracer;
pub mod wildcard;
pub mod wire;

// Re-export main types
pub use config::AgentConfig;
pub use exporter::{
    ExportError, HttpExporter, NullExporter, TelemetryBatch, TelemetryExporter,
    TelemetryExporterBoxed, INTAKE_PATH,
};
pub use lifecycle::{Lifecycle, ServerState, StartupError};
pub use metrics::{MetricCounter, MetricRegistry};
pub use middleware::{counted, traced};
pub use reporter::{ExportMetrics, Reporter, ReporterError};
pub use retry::{RetryConfig, RetryingExporter};
pub use span::{AttributeValue, Span, SpanData, SpanError, SpanKind, SpanStatus};
pub use tracer::{operation_name, InMemorySpanSink, SpanScope, SpanSink, SpanTracer};
pub use wildcard::WildcardMatcher;
pub use wire::{ErrorEvent, IntakeEvent, Metadata, Metricset, Outcome, Sample, Transaction};
