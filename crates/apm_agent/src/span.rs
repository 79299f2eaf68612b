use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// An open span covering one traced handler invocation.
///
/// Name, status, error and attributes may change while the span is open.
/// [`Span::finish`] consumes it and produces the immutable [`SpanData`].
#[derive(Debug, Clone)]
pub struct Span {
    /// Operation name
    name: String,
    /// Span kind
    kind: SpanKind,
    /// Wall-clock start
    start_time: SystemTime,
    /// Monotonic start, used for the duration
    started: Instant,
    /// Span status
    status: SpanStatus,
    /// Captured error, if the traced code failed
    error: Option<SpanError>,
    /// Annotations added while the span was active
    attributes: BTreeMap<String, AttributeValue>,
}

/// Attribute value types for span annotations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanStatus {
    /// No failure was recorded
    #[default]
    Unset,
    /// The traced code failed
    Error,
}

/// Span kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Server-side handling of an inbound request
    Server,
    /// Internal operation span
    Internal,
}

/// Description of the failure recorded on a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanError {
    pub message: String,
}

impl SpanError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for SpanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Span {
    /// Starts a new span now.
    pub fn new(name: impl Into<String>, kind: SpanKind) -> Self {
        Self {
            name: name.into(),
            kind,
            start_time: SystemTime::now(),
            started: Instant::now(),
            status: SpanStatus::Unset,
            error: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the span while it is still open.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn status(&self) -> SpanStatus {
        self.status
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Marks the span failed and keeps the error description.
    pub fn record_error(&mut self, error: SpanError) {
        self.status = SpanStatus::Error;
        self.error = Some(error);
    }

    /// Seals the span, assigning its end time.
    pub fn finish(self) -> SpanData {
        let duration = self.started.elapsed();
        SpanData {
            trace_id: rand::random(),
            span_id: rand::random(),
            name: self.name,
            kind: self.kind,
            start_time: self.start_time,
            end_time: self.start_time + duration,
            duration,
            status: self.status,
            error: self.error,
            attributes: self.attributes,
        }
    }
}

/// A finished span. Nothing about it changes after [`Span::finish`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpanData {
    /// Trace identifier (128-bit)
    pub trace_id: u128,
    /// Span identifier (64-bit)
    pub span_id: u64,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub duration: Duration,
    pub status: SpanStatus,
    pub error: Option<SpanError>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl SpanData {
    /// Start time as microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> u64 {
        self.start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default()
    }

    /// Duration in fractional milliseconds.
    pub fn duration_millis(&self) -> f64 {
        self.duration.as_secs_f64() * 1_000.0
    }

    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }

    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }
}
