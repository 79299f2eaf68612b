use crate::record::TelemetryRecord;
use crate::store::CollectorStore;
use tracing::{debug, warn};

/// What one intake request contained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub transactions: usize,
    pub metricsets: usize,
    pub other: usize,
    pub malformed: usize,
}

impl IngestSummary {
    pub fn lines(&self) -> usize {
        self.transactions + self.metricsets + self.other + self.malformed
    }
}

/// Classifies every non-empty line of an NDJSON body into the store.
///
/// Lines are split on `\r` and `\n`. Malformed lines are logged and skipped;
/// they never fail the request.
pub fn ingest(body: &str, store: &CollectorStore) -> IngestSummary {
    let mut summary = IngestSummary::default();

    for (line_no, line) in body
        .split(['\r', '\n'])
        .filter(|l| !l.trim().is_empty())
        .enumerate()
    {
        match TelemetryRecord::parse(line) {
            Ok(TelemetryRecord::Transaction(transaction)) => {
                debug!(name = %transaction.name, "transaction received");
                store.transactions.push(transaction);
                summary.transactions += 1;
            }
            Ok(TelemetryRecord::Metricset(metricset)) => {
                debug!(samples = metricset.samples.len(), "metricset received");
                store.metrics.put(metricset);
                summary.metricsets += 1;
            }
            Ok(TelemetryRecord::Other(_)) => summary.other += 1,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed telemetry line");
                summary.malformed += 1;
            }
        }
    }

    summary
}
