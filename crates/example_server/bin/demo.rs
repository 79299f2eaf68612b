//! # Instrumented Request Server Demo
//!
//! Wires the whole pipeline in one process:
//!
//! - a [`TelemetryCollector`] playing the APM intake on an ephemeral port;
//! - a [`Reporter`] posting spans and the `page_counter` metric to it;
//! - a [`RequestServer`] whose page handler is wrapped with `traced` and `counted`.
//!
//! It then sends a handful of requests, including `/exit`, and prints the
//! transactions and metrics the collector received.
//!
//! ## Running
//!
//! ```bash
//! cargo run -p example_server --bin demo
//!
//! # More detail, including per-request spans and intake traffic
//! RUST_LOG=debug cargo run -p example_server --bin demo
//!
//! # Skip tracing for some paths
//! APM_TRANSACTION_IGNORE_URLS='/favicon*' cargo run -p example_server --bin demo
//! ```

use anyhow::Context;
use apm_agent::{counted, traced, AgentConfig, MetricCounter, MetricRegistry, Reporter, SpanTracer};
use example_server::{basic_page, RequestServer, ServerConfig};
use mock_apm_server::TelemetryCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::info;
use tracing_subscriber::EnvFilter;

const PATHS: [&str; 5] = [
    "/nothing",
    "/nothing?withsomething=true",
    "/nothing#somelink",
    "/favicon.ico",
    "/exit",
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

async fn get(port: u16, path: &str) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .with_context(|| format!("connecting to port {port}"))?;
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: demo\r\n\r\n").as_bytes())
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ===== Intake =====
    let collector = TelemetryCollector::default();
    collector.start().await.context("starting collector")?;
    let intake_url = collector.url().context("collector has no address")?;

    // ===== Agent =====
    let mut agent = AgentConfig::from_env()
        .with_server_url(intake_url)
        .with_metrics_interval(Duration::from_millis(200));
    if agent.service_name == AgentConfig::default().service_name {
        agent = agent.with_service_name("example-http-server-demo");
    }
    let registry = Arc::new(MetricRegistry::new());
    let reporter = Reporter::with_http(&agent, Arc::clone(&registry)).await;
    let tracer = Arc::new(
        SpanTracer::new(reporter.sink()).with_ignore_urls(&agent.transaction_ignore_urls),
    );
    let page_counter = Arc::new(MetricCounter::new("page_counter", registry));

    // ===== Server =====
    let server = RequestServer::new(
        ServerConfig::default(),
        traced(tracer, counted(Arc::clone(&page_counter), basic_page)),
    );
    let running = server.spawn();
    server.block_until_ready().await;
    let port = server.local_port().context("server has no port")?;
    info!(port, intake = ?collector.url(), "demo ready");

    // ===== Traffic =====
    for path in PATHS {
        let response = get(port, path).await?;
        let status = response.lines().next().unwrap_or_default();
        println!("{path:<32} -> {status}");
    }

    tokio::time::timeout(Duration::from_secs(5), server.block_until_stopped())
        .await
        .context("server did not stop after /exit")?;
    running.await.context("server task")??;

    // ===== Results =====
    println!("\nTransactions received by the collector:");
    while let Ok(tx) = collector.get_transaction(0, QUERY_TIMEOUT).await {
        println!(
            "  {:<24} {:>8.3} ms  outcome={:?}",
            tx.name, tx.duration, tx.outcome
        );
    }

    reporter.shutdown().await?;
    match collector.pop_metricset(QUERY_TIMEOUT).await {
        Some(metricset) => {
            for (name, sample) in &metricset.samples {
                println!("  metric {name} = {}", sample.value);
            }
        }
        None => println!("  no metricset received"),
    }
    println!("  pages served: {}", page_counter.value());

    collector.stop();
    collector.block_until_stopped().await;
    Ok(())
}
