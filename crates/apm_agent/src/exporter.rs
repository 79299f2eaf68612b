use crate::wire::IntakeEvent;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::future::Future;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;

/// Path the intake accepts NDJSON event streams on.
pub const INTAKE_PATH: &str = "/intake/v2/events";

/// Error types for telemetry export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Connection or I/O failure talking to the intake
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The intake answered with a non-2xx status
    #[error("intake rejected batch with status {0}")]
    Rejected(u16),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },
}

/// Events sent to the intake in one request.
#[derive(Debug, Clone)]
pub struct TelemetryBatch {
    pub events: Vec<IntakeEvent>,
    pub timestamp: SystemTime,
}

impl TelemetryBatch {
    pub fn new(events: Vec<IntakeEvent>) -> Self {
        Self {
            events,
            timestamp: SystemTime::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// One JSON object per line, each line newline-terminated.
    pub fn to_ndjson(&self) -> Result<String, ExportError> {
        let mut body = String::new();
        for event in &self.events {
            let line = serde_json::to_string(event)
                .map_err(|e| ExportError::Serialization(e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Trait for shipping telemetry batches to an intake.
///
/// Uses native async fn in traits. For dynamic dispatch use
/// [`TelemetryExporterBoxed`], which every exporter gets for free.
pub trait TelemetryExporter: Send + Sync {
    fn export(&self, batch: TelemetryBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`TelemetryExporter`].
pub trait TelemetryExporterBoxed: Send + Sync {
    fn export_boxed(
        &self,
        batch: TelemetryBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: TelemetryExporter> TelemetryExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: TelemetryBatch,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        TelemetryExporter::name(self)
    }
}

/// Posts batches as NDJSON to `<server_url>/intake/v2/events`.
pub struct HttpExporter {
    client: Client<HttpConnector, Full<Bytes>>,
    endpoint: String,
    timeout: Duration,
}

impl HttpExporter {
    pub fn new(server_url: &str, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            endpoint: format!("{}{}", server_url.trim_end_matches('/'), INTAKE_PATH),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, body: String) -> Result<(), ExportError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.endpoint)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ExportError::Transport(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        let status = response.status();

        // Drain the body so the pooled connection can be reused
        let _ = response.into_body().collect().await;

        if status.is_success() {
            Ok(())
        } else {
            Err(ExportError::Rejected(status.as_u16()))
        }
    }
}

impl TelemetryExporter for HttpExporter {
    async fn export(&self, batch: TelemetryBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = batch.to_ndjson()?;
        debug!(endpoint = %self.endpoint, events = batch.len(), "posting telemetry batch");

        match tokio::time::timeout(self.timeout, self.post(body)).await {
            Ok(result) => result,
            Err(_) => Err(ExportError::Timeout),
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Discards every batch.
#[derive(Debug, Default)]
pub struct NullExporter;

impl TelemetryExporter for NullExporter {
    async fn export(&self, _batch: TelemetryBatch) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Test exporter that records all exported batches for verification
#[cfg(test)]
#[derive(Default)]
pub struct TestExporter {
    batches: std::sync::Mutex<Vec<TelemetryBatch>>,
}

#[cfg(test)]
impl TestExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<TelemetryBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<IntakeEvent> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.events.clone())
            .collect()
    }
}

#[cfg(test)]
impl TelemetryExporter for TestExporter {
    async fn export(&self, batch: TelemetryBatch) -> Result<(), ExportError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    fn name(&self) -> &str {
        "test"
    }
}

/// Fails every export with a fixed error
#[cfg(test)]
pub struct FailingExporter {
    pub error: ExportError,
    pub calls: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl FailingExporter {
    pub fn new(error: ExportError) -> Self {
        Self {
            error,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl TelemetryExporter for FailingExporter {
    async fn export(&self, _batch: TelemetryBatch) -> Result<(), ExportError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(self.error.clone())
    }

    fn name(&self) -> &str {
        "failing"
    }
}
