use crate::retry::RetryConfig;
use std::time::Duration;
use tracing::warn;

pub const ENV_SERVER_URL: &str = "APM_SERVER_URL";
pub const ENV_SERVICE_NAME: &str = "APM_SERVICE_NAME";
pub const ENV_METRICS_INTERVAL_MS: &str = "APM_METRICS_INTERVAL_MS";
pub const ENV_TRANSACTION_IGNORE_URLS: &str = "APM_TRANSACTION_IGNORE_URLS";

/// Agent settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Base URL of the intake, without the events path
    pub server_url: String,
    /// Reported in the metadata line of every batch
    pub service_name: String,
    /// How often counter snapshots are exported
    pub metrics_interval: Duration,
    /// Wildcard patterns for request paths that are never traced
    pub transaction_ignore_urls: Vec<String>,
    /// Retry policy for the HTTP exporter
    pub retry: RetryConfig,
    /// Per-request timeout of the HTTP exporter
    pub export_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8200".to_string(),
            service_name: "example-http-server".to_string(),
            metrics_interval: Duration::from_secs(30),
            transaction_ignore_urls: Vec::new(),
            retry: RetryConfig::default(),
            export_timeout: Duration::from_secs(5),
        }
    }
}

impl AgentConfig {
    /// Fast-reporting preset for tests against a local collector.
    pub fn for_local_collector(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            metrics_interval: Duration::from_millis(100),
            retry: RetryConfig::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(20)),
            export_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Defaults overridden by `APM_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            config.server_url = url.trim().to_string();
        }
        if let Some(name) = lookup(ENV_SERVICE_NAME).filter(|v| !v.trim().is_empty()) {
            config.service_name = name.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_METRICS_INTERVAL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.metrics_interval = Duration::from_millis(ms),
                _ => warn!(
                    variable = ENV_METRICS_INTERVAL_MS,
                    value = %raw,
                    default_ms = config.metrics_interval.as_millis() as u64,
                    "invalid metrics interval, using default"
                ),
            }
        }
        if let Some(raw) = lookup(ENV_TRANSACTION_IGNORE_URLS) {
            config.transaction_ignore_urls = raw
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }

        config
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Sets the snapshot period. A zero period is ignored with a warning.
    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        if interval.is_zero() {
            warn!(
                current_ms = self.metrics_interval.as_millis() as u64,
                "zero metrics interval ignored"
            );
        } else {
            self.metrics_interval = interval;
        }
        self
    }

    pub fn with_transaction_ignore_urls<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transaction_ignore_urls = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        assert_eq!(AgentConfig::from_lookup(lookup(&[])), AgentConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::from_lookup(lookup(&[
            (ENV_SERVER_URL, "http://collector:8200"),
            (ENV_SERVICE_NAME, "checkout"),
            (ENV_METRICS_INTERVAL_MS, "250"),
            (ENV_TRANSACTION_IGNORE_URLS, "/exit*, *.ico ,,"),
        ]));

        assert_eq!(config.server_url, "http://collector:8200");
        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.metrics_interval, Duration::from_millis(250));
        assert_eq!(config.transaction_ignore_urls, vec!["/exit*", "*.ico"]);
    }

    #[test]
    fn test_invalid_interval_falls_back() {
        for bad in ["soon", "0", "-5"] {
            let config = AgentConfig::from_lookup(lookup(&[(ENV_METRICS_INTERVAL_MS, bad)]));
            assert_eq!(config.metrics_interval, AgentConfig::default().metrics_interval);
        }
    }

    #[test]
    fn test_zero_interval_builder_keeps_previous() {
        let config = AgentConfig::default()
            .with_metrics_interval(Duration::from_millis(40))
            .with_metrics_interval(Duration::ZERO);
        assert_eq!(config.metrics_interval, Duration::from_millis(40));
    }
}
