use std::time::Duration;
use thiserror::Error;

/// A telemetry line the collector could not use.
#[derive(Debug, Error)]
pub enum MalformedTelemetry {
    /// Not valid JSON
    #[error("invalid JSON: {0}")]
    Json(#[source] serde_json::Error),
    /// Valid JSON, but a recognised record did not have the expected fields
    #[error("malformed {kind} record: {source}")]
    Shape {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Error types for collector queries
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// No transaction arrived at the index before the timeout
    #[error("no transaction at index {index} after waiting {timeout:?}")]
    NotFound { index: usize, timeout: Duration },
}
