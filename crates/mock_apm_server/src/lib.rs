//! Mock APM intake for tests
//!
//! A [`TelemetryCollector`] listens on a local port, accepts NDJSON telemetry
//! the way an APM server intake does, and keeps what it receives:
//!
//! - transactions, in arrival order, read destructively by index;
//! - the most recent metricset, popped destructively.
//!
//! Both reads wait up to a caller-supplied timeout, so a test can post a
//! request to an instrumented server and then block until the telemetry it
//! expects shows up.
//!
//! ```ignore
//! let collector = TelemetryCollector::default();
//! collector.start().await?;
//! // ... drive the system under test at collector.url() ...
//! let tx = collector.get_transaction(0, Duration::from_secs(2)).await?;
//! assert_eq!(tx.name, "GET /nothing");
//! ```

pub mod error;
pub mod ingest;
pub mod record;
pub mod server;
pub mod store;

pub use error::{MalformedTelemetry, QueryError};
pub use ingest::{ingest, IngestSummary};
pub use record::TelemetryRecord;
pub use server::{CollectorConfig, TelemetryCollector};
pub use store::{CollectorStore, MetricMailbox, TransactionBuffer};
