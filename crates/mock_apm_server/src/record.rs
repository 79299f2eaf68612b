//! Classification of intake lines.
//!
//! Each NDJSON line is one JSON object keyed by its event type. The collector
//! keeps transactions and metricsets and counts everything else.

use crate::error::MalformedTelemetry;
use apm_agent::wire::{Metricset, Transaction};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Transaction(Transaction),
    Metricset(Metricset),
    /// Any other valid JSON (metadata, errors, spans, metricsets without samples)
    Other(Value),
}

impl TelemetryRecord {
    pub fn parse(line: &str) -> Result<Self, MalformedTelemetry> {
        let value: Value = serde_json::from_str(line).map_err(MalformedTelemetry::Json)?;
        Self::classify(value)
    }

    fn classify(mut value: Value) -> Result<Self, MalformedTelemetry> {
        let Some(object) = value.as_object_mut() else {
            return Ok(TelemetryRecord::Other(value));
        };

        if let Some(transaction) = object.remove("transaction") {
            return serde_json::from_value(transaction)
                .map(TelemetryRecord::Transaction)
                .map_err(|source| MalformedTelemetry::Shape {
                    kind: "transaction",
                    source,
                });
        }

        let has_samples = object
            .get("metricset")
            .and_then(Value::as_object)
            .is_some_and(|m| m.contains_key("samples"));
        if has_samples {
            if let Some(metricset) = object.remove("metricset") {
                return serde_json::from_value(metricset)
                    .map(TelemetryRecord::Metricset)
                    .map_err(|source| MalformedTelemetry::Shape {
                        kind: "metricset",
                        source,
                    });
            }
        }

        Ok(TelemetryRecord::Other(value))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryRecord::Transaction(_) => "transaction",
            TelemetryRecord::Metricset(_) => "metricset",
            TelemetryRecord::Other(_) => "other",
        }
    }
}
