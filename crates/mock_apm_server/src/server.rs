use crate::error::QueryError;
use crate::ingest::ingest;
use crate::store::CollectorStore;
use apm_agent::lifecycle::{Lifecycle, ServerState, StartupError};
use apm_agent::wire::{Metricset, Transaction};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Configuration for the telemetry collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Address to listen on. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        }
    }
}

impl CollectorConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }
}

struct Inner {
    config: CollectorConfig,
    lifecycle: Lifecycle,
    store: CollectorStore,
    local_addr: OnceLock<SocketAddr>,
}

/// In-process APM intake.
///
/// Accepts NDJSON telemetry on any path except `/exit`, keeps transactions
/// and the latest metricset, and answers queries with bounded waits. Clones
/// share one collector.
#[derive(Clone)]
pub struct TelemetryCollector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TelemetryCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryCollector")
            .field("state", &self.state())
            .field("local_addr", &self.inner.local_addr.get())
            .finish_non_exhaustive()
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new(CollectorConfig::default())
    }
}

impl TelemetryCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                lifecycle: Lifecycle::new(),
                store: CollectorStore::new(),
                local_addr: OnceLock::new(),
            }),
        }
    }

    /// Binds the listener, spawns the accept loop and returns the bound port.
    pub async fn start(&self) -> Result<u16, StartupError> {
        let lifecycle = &self.inner.lifecycle;
        lifecycle.claim_start()?;

        let bound = match TcpListener::bind(self.inner.config.bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                lifecycle.advance(ServerState::Stopped);
                warn!(addr = %self.inner.config.bind_addr, error = %e, "collector failed to bind");
                return Err(StartupError::Bind(e));
            }
        };

        let _ = self.inner.local_addr.set(addr);
        lifecycle.advance(ServerState::Listening);
        info!(%addr, "telemetry collector listening");

        let collector = self.clone();
        tokio::spawn(async move { collector.accept_loop(listener).await });

        Ok(addr.port())
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let collector = self.clone();
                        tokio::spawn(async move { collector.serve_connection(stream, peer).await });
                    }
                    Err(e) => warn!(error = %e, "collector accept failed"),
                },

                _ = self.inner.lifecycle.wait_until(|s| *s >= ServerState::Stopping) => break,
            }
        }

        drop(listener);
        self.inner.lifecycle.advance(ServerState::Stopped);
        info!("telemetry collector stopped");
    }

    async fn serve_connection(self, stream: TcpStream, peer: SocketAddr) {
        let service = service_fn(move |request| {
            let collector = self.clone();
            async move { collector.route(request).await }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            debug!(%peer, error = %e, "collector connection closed with error");
        }
    }

    async fn route(&self, request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = request.uri().path();
        if path == "/exit" || path.starts_with("/exit/") {
            info!("exit requested, stopping collector");
            let collector = self.clone();
            tokio::spawn(async move { collector.stop() });
            return Ok(json_ok());
        }

        match request.into_body().collect().await {
            Ok(collected) => {
                let body = collected.to_bytes();
                let summary = ingest(&String::from_utf8_lossy(&body), &self.inner.store);
                debug!(
                    transactions = summary.transactions,
                    metricsets = summary.metricsets,
                    other = summary.other,
                    malformed = summary.malformed,
                    "intake request processed"
                );
                Ok(json_ok())
            }
            Err(e) => {
                warn!(error = %e, "failed to read intake body");
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                Ok(response)
            }
        }
    }

    /// Stops accepting connections. Idempotent; a no-op before `start()`.
    pub fn stop(&self) {
        if !self.inner.lifecycle.is_start_claimed() {
            debug!("stop called on a collector that was never started");
            return;
        }
        if self.inner.lifecycle.advance(ServerState::Stopping) {
            info!("telemetry collector stopping");
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.lifecycle.state()
    }

    /// Waits until the collector is listening (or already past it).
    pub async fn block_until_ready(&self) -> ServerState {
        self.inner
            .lifecycle
            .wait_until(|s| *s >= ServerState::Listening)
            .await
    }

    /// Waits until the collector has stopped. Returns at once if it never started.
    pub async fn block_until_stopped(&self) -> ServerState {
        if !self.inner.lifecycle.is_start_claimed() {
            return self.state();
        }
        self.inner
            .lifecycle
            .wait_until(|s| *s == ServerState::Stopped)
            .await
    }

    pub fn local_port(&self) -> Option<u16> {
        self.inner.local_addr.get().map(SocketAddr::port)
    }

    /// Base URL agents should report to.
    pub fn url(&self) -> Option<String> {
        self.local_port().map(|port| format!("http://127.0.0.1:{port}"))
    }

    // ===== Query API =====

    /// Waits up to `timeout` for transaction `index` and removes it.
    ///
    /// Removal shifts later transactions down, so reading `0` repeatedly
    /// walks the buffer in arrival order.
    pub async fn get_transaction(
        &self,
        index: usize,
        timeout: Duration,
    ) -> Result<Transaction, QueryError> {
        self.inner.store.transactions.take(index, timeout).await
    }

    pub fn transaction_count(&self) -> usize {
        self.inner.store.transactions.len()
    }

    /// Waits up to `timeout` for a metricset and takes it. `None` on timeout.
    pub async fn pop_metricset(&self, timeout: Duration) -> Option<Metricset> {
        self.inner.store.metrics.pop(timeout).await
    }

    pub fn store(&self) -> &CollectorStore {
        &self.inner.store
    }
}

fn json_ok() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(b"{}")));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
