//! Intake wire types.
//!
//! One [`IntakeEvent`] per NDJSON line, externally tagged:
//!
//! ```text
//! {"metadata":{"service":{"name":"example","agent":{"name":"rust","version":"0.1.0"}}}}
//! {"transaction":{"name":"GET /nothing","duration":0.42,"type":"request",...}}
//! {"metricset":{"samples":{"page_counter":{"value":3.0}},"timestamp":...}}
//! ```
//!
//! Only the fields the harness reads are modeled. Unknown fields on
//! transactions and metricsets survive a decode in `extra`.

use crate::span::{AttributeValue, SpanData};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Transaction type the agent assigns to server spans.
pub const REQUEST_TYPE: &str = "request";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub name: String,
    /// Milliseconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Microseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub labels: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    #[serde(other)]
    Unknown,
}

impl Transaction {
    /// Minimal transaction, as a test client would post it.
    pub fn new(name: impl Into<String>, duration: f64) -> Self {
        Self {
            name: name.into(),
            duration,
            id: None,
            trace_id: None,
            kind: None,
            timestamp: None,
            outcome: None,
            labels: Map::new(),
            extra: Map::new(),
        }
    }

    /// Builds the intake view of a finished server span.
    pub fn from_span(span: &SpanData) -> Self {
        Self {
            name: span.name.clone(),
            duration: span.duration_millis(),
            id: Some(span.span_id_hex()),
            trace_id: Some(span.trace_id_hex()),
            kind: Some(REQUEST_TYPE.to_string()),
            timestamp: Some(span.timestamp_micros()),
            outcome: Some(if span.is_error() {
                Outcome::Failure
            } else {
                Outcome::Success
            }),
            labels: span
                .attributes
                .iter()
                .map(|(key, value)| (key.clone(), label_value(value)))
                .collect(),
            extra: Map::new(),
        }
    }
}

fn label_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::String(s) => Value::String(s.clone()),
        AttributeValue::Int(i) => Value::from(*i),
        AttributeValue::Float(f) => Value::from(*f),
        AttributeValue::Bool(b) => Value::Bool(*b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metricset {
    pub samples: BTreeMap<String, Sample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Metricset {
    pub fn sample(&self, name: &str) -> Option<f64> {
        self.samples.get(name).map(|s| s.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub service: Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

impl Metadata {
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service: Service {
                name: service_name.into(),
                agent: AgentInfo {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub id: String,
    pub trace_id: String,
    pub transaction_id: String,
    pub exception: Exception,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub message: String,
}

impl ErrorEvent {
    /// Error event for a failed span, `None` if the span succeeded.
    pub fn from_span(span: &SpanData) -> Option<Self> {
        let error = span.error.as_ref()?;
        Some(Self {
            id: format!("{:032x}", rand::random::<u128>()),
            trace_id: span.trace_id_hex(),
            transaction_id: span.span_id_hex(),
            exception: Exception {
                message: error.message.clone(),
            },
        })
    }
}

/// One NDJSON line of an intake request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntakeEvent {
    Metadata(Metadata),
    Transaction(Transaction),
    Error(ErrorEvent),
    Metricset(Metricset),
}

impl IntakeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            IntakeEvent::Metadata(_) => "metadata",
            IntakeEvent::Transaction(_) => "transaction",
            IntakeEvent::Error(_) => "error",
            IntakeEvent::Metricset(_) => "metricset",
        }
    }
}
