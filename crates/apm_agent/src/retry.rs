//! Retry wrapper for any [`TelemetryExporter`].

use crate::exporter::{ExportError, TelemetryBatch, TelemetryExporter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

// ===== Backoff =====

/// How hard to push a batch at an intake that is down or refusing it.
///
/// Waits double from `base_delay` after every failed attempt, up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Extra attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// One attempt per batch.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Pause before `attempt`, counted from 0. The first attempt goes out at once.
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        match attempt {
            0 => Duration::ZERO,
            n => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .map_or(self.max_delay, |d| d.min(self.max_delay))
            }
        }
    }
}

// ===== Exporter =====

/// Retries failed exports with capped exponential backoff.
///
/// ```ignore
/// let exporter = RetryingExporter::new(HttpExporter::new(url, timeout), RetryConfig::default());
/// exporter.export(batch).await?;
/// ```
pub struct RetryingExporter<E: TelemetryExporter> {
    inner: E,
    config: RetryConfig,
    /// Metrics: total retry attempts made
    total_retries: AtomicU64,
    /// Metrics: successful exports after retry (not first attempt)
    recovered_exports: AtomicU64,
}

impl<E: TelemetryExporter> RetryingExporter<E> {
    pub fn new(inner: E, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
            recovered_exports: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(inner: E) -> Self {
        Self::new(inner, RetryConfig::default())
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Returns the total number of retry attempts made.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    /// Returns exports that succeeded after at least one retry.
    pub fn recovered_exports(&self) -> u64 {
        self.recovered_exports.load(Ordering::Relaxed)
    }
}

impl<E: TelemetryExporter> TelemetryExporter for RetryingExporter<E> {
    async fn export(&self, batch: TelemetryBatch) -> Result<(), ExportError> {
        let max_attempts = self.config.max_retries + 1;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                self.total_retries.fetch_add(1, Ordering::Relaxed);
                sleep(self.config.backoff_before(attempt)).await;
            }

            match self.inner.export(batch.clone()).await {
                Ok(()) if attempt > 0 => {
                    self.recovered_exports.fetch_add(1, Ordering::Relaxed);
                    debug!(exporter = self.inner.name(), attempt, "intake accepted batch after retry");
                    return Ok(());
                }
                Ok(()) => return Ok(()),
                // A batch that cannot be encoded fails the same way every time
                Err(e @ ExportError::Serialization(_)) => return Err(e),
                Err(e) => {
                    debug!(exporter = self.inner.name(), attempt, error = %e, "export attempt failed");
                }
            }
        }

        Err(ExportError::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{FailingExporter, TestExporter};
    use std::sync::atomic::AtomicU32;

    fn fast() -> RetryConfig {
        RetryConfig::default()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_before(0), Duration::ZERO);
        assert_eq!(config.backoff_before(1), Duration::from_millis(100));
        assert_eq!(config.backoff_before(3), Duration::from_millis(400));
        assert_eq!(config.backoff_before(20), config.max_delay);
        assert_eq!(config.backoff_before(u32::MAX), config.max_delay);
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let exporter = RetryingExporter::new(TestExporter::new(), fast());
        exporter.export(TelemetryBatch::new(vec![])).await.unwrap();

        assert_eq!(exporter.total_retries(), 0);
        assert_eq!(exporter.inner().batches().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let exporter = RetryingExporter::new(
            FailingExporter::new(ExportError::Rejected(503)),
            fast().with_max_retries(2),
        );

        let result = exporter.export(TelemetryBatch::new(vec![])).await;
        assert_eq!(result, Err(ExportError::RetriesExhausted { attempts: 3 }));
        assert_eq!(exporter.inner().calls(), 3);
        assert_eq!(exporter.total_retries(), 2);
    }

    #[tokio::test]
    async fn test_serialization_error_is_not_retried() {
        let exporter = RetryingExporter::new(
            FailingExporter::new(ExportError::Serialization("bad float".into())),
            fast(),
        );

        let result = exporter.export(TelemetryBatch::new(vec![])).await;
        assert!(matches!(result, Err(ExportError::Serialization(_))));
        assert_eq!(exporter.inner().calls(), 1);
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyExporter {
        failures: u32,
        calls: AtomicU32,
    }

    impl TelemetryExporter for FlakyExporter {
        async fn export(&self, _batch: TelemetryBatch) -> Result<(), ExportError> {
            let call = self.calls.fetch_add(1, Ordering::Relaxed);
            if call < self.failures {
                Err(ExportError::Transport("connection refused".into()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let exporter = RetryingExporter::new(
            FlakyExporter {
                failures: 2,
                calls: AtomicU32::new(0),
            },
            fast(),
        );

        exporter.export(TelemetryBatch::new(vec![])).await.unwrap();
        assert_eq!(exporter.recovered_exports(), 1);
        assert_eq!(exporter.total_retries(), 2);
    }
}
