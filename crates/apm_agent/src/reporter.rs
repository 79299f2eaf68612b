use crate::config::AgentConfig;
use crate::exporter::{HttpExporter, TelemetryBatch, TelemetryExporterBoxed};
use crate::metrics::MetricRegistry;
use crate::retry::RetryingExporter;
use crate::span::SpanData;
use crate::tracer::SpanSink;
use crate::wire::{ErrorEvent, IntakeEvent, Metadata, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Floor for the snapshot period; a zero period would stall the interval timer.
const MIN_METRICS_INTERVAL: Duration = Duration::from_millis(1);

/// Error types for reporter operations
#[derive(Debug, Error)]
pub enum ReporterError {
    /// The background task panicked or was cancelled
    #[error("reporter task failed: {0}")]
    TaskFailed(String),
}

/// Thread-safe export counters (uses atomics)
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Intake events successfully exported
    pub events_exported: AtomicU64,
    /// Batches successfully exported
    pub batches_exported: AtomicU64,
    /// Batches that failed to export
    pub export_errors: AtomicU64,
    /// Spans handed to the sink after the reporter shut down
    pub spans_dropped: AtomicU64,
}

impl ExportMetrics {
    pub fn events_exported(&self) -> u64 {
        self.events_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    fn record_success(&self, event_count: u64) {
        self.events_exported.fetch_add(event_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exports a batch and records the outcome. Failures are logged, never returned.
async fn export_batch(
    exporter: &dyn TelemetryExporterBoxed,
    batch: TelemetryBatch,
    metrics: &ExportMetrics,
) {
    let event_count = batch.len() as u64;
    match exporter.export_boxed(batch).await {
        Ok(()) => metrics.record_success(event_count),
        Err(e) => {
            metrics.record_error();
            warn!(exporter = exporter.name(), error = %e, "telemetry export failed");
        }
    }
}

fn span_batch(metadata: &Metadata, span: &SpanData) -> TelemetryBatch {
    let mut events = vec![
        IntakeEvent::Metadata(metadata.clone()),
        IntakeEvent::Transaction(Transaction::from_span(span)),
    ];
    if let Some(error) = ErrorEvent::from_span(span) {
        events.push(IntakeEvent::Error(error));
    }
    TelemetryBatch::new(events)
}

fn metrics_batch(metadata: &Metadata, registry: &MetricRegistry) -> Option<TelemetryBatch> {
    let metricset = registry.snapshot()?;
    Some(TelemetryBatch::new(vec![
        IntakeEvent::Metadata(metadata.clone()),
        IntakeEvent::Metricset(metricset),
    ]))
}

/// Sink handed to the tracer. Queues spans for the reporter task.
struct ReporterSink {
    spans: mpsc::UnboundedSender<SpanData>,
    metrics: Arc<ExportMetrics>,
}

impl SpanSink for ReporterSink {
    fn on_end(&self, span: SpanData) {
        if let Err(mpsc::error::SendError(span)) = self.spans.send(span) {
            self.metrics.spans_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(operation = %span.name, "reporter stopped, span dropped");
        }
    }
}

/// Background task that ships finished spans and counter snapshots to the intake.
///
/// Spans are exported as soon as they arrive, one batch per span. Counters are
/// snapshotted every `metrics_interval`, and once more on shutdown.
pub struct Reporter {
    spans: mpsc::UnboundedSender<SpanData>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    metrics: Arc<ExportMetrics>,
}

impl Reporter {
    /// Spawns the reporter task on the current runtime.
    pub async fn start(
        config: &AgentConfig,
        registry: Arc<MetricRegistry>,
        exporter: Arc<dyn TelemetryExporterBoxed>,
    ) -> Self {
        let (spans, mut span_rx) = mpsc::unbounded_channel::<SpanData>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let metrics = Arc::new(ExportMetrics::default());

        let metadata = Metadata::for_service(config.service_name.clone());
        let metrics_interval = config.metrics_interval.max(MIN_METRICS_INTERVAL);
        let task_metrics = Arc::clone(&metrics);

        info!(
            exporter = exporter.name(),
            service = %config.service_name,
            metrics_interval_ms = metrics_interval.as_millis() as u64,
            "reporter started"
        );

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(metrics_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing has been counted yet
            interval.tick().await;

            loop {
                tokio::select! {
                    Some(span) = span_rx.recv() => {
                        let batch = span_batch(&metadata, &span);
                        export_batch(exporter.as_ref(), batch, &task_metrics).await;
                    }

                    _ = interval.tick() => {
                        if let Some(batch) = metrics_batch(&metadata, &registry) {
                            export_batch(exporter.as_ref(), batch, &task_metrics).await;
                        }
                    }

                    _ = &mut shutdown_rx => {
                        // Drain spans queued before shutdown
                        span_rx.close();
                        while let Some(span) = span_rx.recv().await {
                            let batch = span_batch(&metadata, &span);
                            export_batch(exporter.as_ref(), batch, &task_metrics).await;
                        }

                        if let Some(batch) = metrics_batch(&metadata, &registry) {
                            export_batch(exporter.as_ref(), batch, &task_metrics).await;
                        }
                        break;
                    }
                }
            }

            debug!("reporter task finished");
        });

        Self {
            spans,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            metrics,
        }
    }

    /// Reporter posting to `config.server_url` over HTTP, with retries.
    pub async fn with_http(config: &AgentConfig, registry: Arc<MetricRegistry>) -> Self {
        let exporter = RetryingExporter::new(
            HttpExporter::new(&config.server_url, config.export_timeout),
            config.retry.clone(),
        );
        Self::start(config, registry, Arc::new(exporter)).await
    }

    /// The sink a [`SpanTracer`](crate::tracer::SpanTracer) reports into.
    pub fn sink(&self) -> Arc<dyn SpanSink> {
        Arc::new(ReporterSink {
            spans: self.spans.clone(),
            metrics: Arc::clone(&self.metrics),
        })
    }

    pub fn export_metrics(&self) -> &Arc<ExportMetrics> {
        &self.metrics
    }

    /// Exports everything queued so far, sends a final metricset and joins the task.
    pub async fn shutdown(mut self) -> Result<(), ReporterError> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| ReporterError::TaskFailed(e.to_string()))?;
        }

        info!(
            events = self.metrics.events_exported(),
            batches = self.metrics.batches_exported(),
            errors = self.metrics.export_errors(),
            "reporter stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{ExportError, FailingExporter, TestExporter};
    use crate::metrics::MetricCounter;
    use crate::tracer::SpanTracer;

    fn config(interval: Duration) -> AgentConfig {
        AgentConfig::default()
            .with_service_name("reporter-test")
            .with_metrics_interval(interval)
    }

    #[tokio::test]
    async fn test_spans_exported_with_metadata() {
        let exporter = Arc::new(TestExporter::new());
        let registry = Arc::new(MetricRegistry::new());
        let reporter =
            Reporter::start(&config(Duration::from_secs(60)), registry, exporter.clone()).await;

        let tracer = SpanTracer::new(reporter.sink());
        let scope = tracer.on_enter("GET /nothing HTTP/1.1");
        tracer.on_exit::<str>(scope, None);
        let scope = tracer.on_enter("GET /broken HTTP/1.1");
        tracer.on_exit(scope, Some("boom"));

        reporter.shutdown().await.unwrap();

        let batches = exporter.batches();
        assert_eq!(batches.len(), 2);
        assert!(matches!(batches[0].events[0], IntakeEvent::Metadata(_)));
        match &batches[0].events[1] {
            IntakeEvent::Transaction(tx) => assert_eq!(tx.name, "GET /nothing"),
            other => panic!("expected transaction, got {}", other.kind()),
        }
        assert_eq!(batches[0].len(), 2);
        // Failed span carries an error event
        assert_eq!(batches[1].len(), 3);
        assert!(matches!(batches[1].events[2], IntakeEvent::Error(_)));
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let exporter = Arc::new(TestExporter::new());
        let registry = Arc::new(MetricRegistry::new());
        let config = AgentConfig {
            metrics_interval: Duration::ZERO,
            ..config(Duration::from_secs(60))
        };
        let reporter = Reporter::start(&config, registry, exporter.clone()).await;

        let tracer = SpanTracer::new(reporter.sink());
        let scope = tracer.on_enter("GET /nothing HTTP/1.1");
        tracer.on_exit::<str>(scope, None);

        let metrics = Arc::clone(reporter.export_metrics());
        reporter.shutdown().await.unwrap();

        assert_eq!(metrics.spans_dropped(), 0);
        assert_eq!(exporter.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_exported_on_interval() {
        let exporter = Arc::new(TestExporter::new());
        let registry = Arc::new(MetricRegistry::new());
        let counter = MetricCounter::new("page_counter", Arc::clone(&registry));
        counter.record();

        let reporter = Reporter::start(
            &config(Duration::from_millis(20)),
            Arc::clone(&registry),
            exporter.clone(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let metricsets = exporter
            .events()
            .into_iter()
            .filter(|e| matches!(e, IntakeEvent::Metricset(_)))
            .count();
        assert!(metricsets >= 1);

        reporter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_final_metricset() {
        let exporter = Arc::new(TestExporter::new());
        let registry = Arc::new(MetricRegistry::new());
        let reporter = Reporter::start(
            &config(Duration::from_secs(60)),
            Arc::clone(&registry),
            exporter.clone(),
        )
        .await;

        let counter = MetricCounter::new("page_counter", Arc::clone(&registry));
        counter.record();
        counter.record();
        reporter.shutdown().await.unwrap();

        let last = exporter.events().into_iter().last().unwrap();
        match last {
            IntakeEvent::Metricset(m) => assert_eq!(m.sample("page_counter"), Some(2.0)),
            other => panic!("expected metricset, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_export_errors_are_counted_not_propagated() {
        let exporter = Arc::new(FailingExporter::new(ExportError::Rejected(500)));
        let reporter = Reporter::start(
            &config(Duration::from_secs(60)),
            Arc::new(MetricRegistry::new()),
            exporter.clone(),
        )
        .await;
        let metrics = Arc::clone(reporter.export_metrics());

        let tracer = SpanTracer::new(reporter.sink());
        for _ in 0..3 {
            let scope = tracer.on_enter("GET / HTTP/1.1");
            tracer.on_exit::<str>(scope, None);
        }
        reporter.shutdown().await.unwrap();

        assert_eq!(metrics.export_errors(), 3);
        assert_eq!(metrics.batches_exported(), 0);
        assert_eq!(exporter.calls(), 3);
    }

    #[tokio::test]
    async fn test_spans_after_shutdown_are_dropped() {
        let reporter = Reporter::start(
            &config(Duration::from_secs(60)),
            Arc::new(MetricRegistry::new()),
            Arc::new(TestExporter::new()),
        )
        .await;
        let sink = reporter.sink();
        let metrics = Arc::clone(reporter.export_metrics());
        reporter.shutdown().await.unwrap();

        let tracer = SpanTracer::new(sink);
        let scope = tracer.on_enter("GET /late HTTP/1.1");
        tracer.on_exit::<str>(scope, None);

        assert_eq!(metrics.spans_dropped(), 1);
    }
}
