//! Single-threaded HTTP page server.
//!
//! Deliberately minimal: one connection at a time, one request per
//! connection, no keep-alive, every response is `200 OK` with whatever page
//! the handler returns. `GET /exit` shuts the server down after it has been
//! answered.

use crate::config::ServerConfig;
use crate::page::{Handler, HandlerError};
use apm_agent::lifecycle::{Lifecycle, ServerState, StartupError};
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Request line prefix that stops the server.
pub const EXIT_REQUEST: &str = "GET /exit";

/// What happened to one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Answered, keep accepting
    Served,
    /// The peer sent nothing
    Empty,
    /// The handler failed, nothing was written
    Abandoned,
    /// An exit request was processed
    Exit,
}

struct Inner {
    config: ServerConfig,
    handler: Box<Handler>,
    lifecycle: Lifecycle,
    local_addr: OnceLock<SocketAddr>,
}

/// HTTP server that hands each request line to a handler function.
///
/// Clones share one server, so one task can run [`start`](Self::start) while
/// another waits on it or stops it.
#[derive(Clone)]
pub struct RequestServer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestServer")
            .field("state", &self.state())
            .field("local_addr", &self.inner.local_addr.get())
            .finish_non_exhaustive()
    }
}

impl RequestServer {
    pub fn new(
        config: ServerConfig,
        handler: impl Fn(&str) -> Result<String, HandlerError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler: Box::new(handler),
                lifecycle: Lifecycle::new(),
                local_addr: OnceLock::new(),
            }),
        }
    }

    /// Binds and serves until stopped or sent `GET /exit`.
    ///
    /// Returns once the listener is closed. Fails if this instance was already
    /// started or the address cannot be bound.
    pub async fn start(&self) -> Result<(), StartupError> {
        let lifecycle = &self.inner.lifecycle;
        lifecycle.claim_start()?;
        info!("request server starting");

        let bound = match TcpListener::bind(self.inner.config.bind_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                lifecycle.advance(ServerState::Stopped);
                warn!(addr = %self.inner.config.bind_addr, error = %e, "request server failed to bind");
                return Err(StartupError::Bind(e));
            }
        };

        let _ = self.inner.local_addr.set(addr);
        lifecycle.advance(ServerState::Listening);
        info!(%addr, "request server listening");

        loop {
            let stopping = lifecycle.wait_until(|s| *s >= ServerState::Stopping);
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = stopping => break,
            };

            debug!(%peer, "client connected");
            let outcome = tokio::select! {
                outcome = self.process_client(stream) => outcome,
                _ = lifecycle.wait_until(|s| *s >= ServerState::Stopping) => {
                    debug!(%peer, "stopped while serving, connection dropped");
                    break;
                }
            };

            match outcome {
                Ok(Outcome::Exit) => {
                    info!("exit requested");
                    lifecycle.advance(ServerState::Stopping);
                    break;
                }
                Ok(outcome) => debug!(%peer, ?outcome, "connection finished"),
                Err(e) => warn!(%peer, error = %e, "connection failed"),
            }
        }

        drop(listener);
        lifecycle.advance(ServerState::Stopped);
        info!("request server stopped");
        Ok(())
    }

    async fn process_client(&self, stream: TcpStream) -> io::Result<Outcome> {
        let mut stream = BufReader::new(stream);

        let Some(request_line) = self.read_request_line(&mut stream).await? else {
            debug!("no request line, closing connection");
            return Ok(Outcome::Empty);
        };
        debug!(header = %request_line, "request line");

        let mut header = String::new();
        loop {
            header.clear();
            let read = stream.read_line(&mut header).await?;
            let line = header.trim_end_matches(['\r', '\n']);
            if read == 0 || line.is_empty() {
                break;
            }
            debug!(header = %line, "request header");
        }

        let exit = request_line.starts_with(EXIT_REQUEST);
        let handled = panic::catch_unwind(AssertUnwindSafe(|| (self.inner.handler)(&request_line)));
        let page = match handled {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                warn!(request = %request_line, error = %e, "handler failed, abandoning connection");
                return Ok(if exit { Outcome::Exit } else { Outcome::Abandoned });
            }
            Err(payload) => {
                warn!(
                    request = %request_line,
                    panic = panic_message(payload.as_ref()),
                    "handler panicked, abandoning connection"
                );
                return Ok(if exit { Outcome::Exit } else { Outcome::Abandoned });
            }
        };

        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             Server: ExampleHttpServer\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            page.len(),
            page
        );
        let stream = stream.get_mut();
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        stream.shutdown().await?;

        Ok(if exit { Outcome::Exit } else { Outcome::Served })
    }

    /// Reads the request line, trying once more after a short pause if the
    /// first read comes back empty.
    async fn read_request_line(
        &self,
        stream: &mut BufReader<TcpStream>,
    ) -> io::Result<Option<String>> {
        let mut line = String::new();
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(self.inner.config.read_retry_delay).await;
            }
            line.clear();
            if stream.read_line(&mut line).await? > 0 {
                return Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()));
            }
        }
        Ok(None)
    }

    /// Runs [`start`](Self::start) on a new task.
    pub fn spawn(&self) -> JoinHandle<Result<(), StartupError>> {
        let server = self.clone();
        tokio::spawn(async move { server.start().await })
    }

    /// Closes the listener. Logs a warning if the server was never started.
    pub fn stop(&self) {
        if !self.inner.lifecycle.is_start_claimed() {
            warn!("stop() called on a request server that was never started");
            return;
        }
        if self.inner.lifecycle.advance(ServerState::Stopping) {
            info!("request server stopping");
        }
    }

    pub fn state(&self) -> ServerState {
        self.inner.lifecycle.state()
    }

    /// `None` until the listener is bound.
    pub fn local_port(&self) -> Option<u16> {
        self.inner.local_addr.get().map(SocketAddr::port)
    }

    /// Waits until the server is listening (or already past it).
    pub async fn block_until_ready(&self) -> ServerState {
        self.inner
            .lifecycle
            .wait_until(|s| *s >= ServerState::Listening)
            .await
    }

    /// Waits until the server has stopped. Returns at once if it never started.
    pub async fn block_until_stopped(&self) -> ServerState {
        if !self.inner.lifecycle.is_start_claimed() {
            return self.state();
        }
        self.inner
            .lifecycle
            .wait_until(|s| *s == ServerState::Stopped)
            .await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
