//! Request server over raw TCP.

use apm_agent::lifecycle::ServerState;
use example_server::{basic_page, HandlerError, RequestServer, ServerConfig, THE_PAGE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(2);

async fn send(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

async fn get(port: u16, path: &str) -> String {
    send(port, &format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n")).await
}

async fn running(server: &RequestServer) -> (tokio::task::JoinHandle<Result<(), apm_agent::StartupError>>, u16) {
    let handle = server.spawn();
    tokio::time::timeout(WAIT, server.block_until_ready()).await.unwrap();
    let port = server.local_port().unwrap();
    (handle, port)
}

#[tokio::test]
async fn test_serves_fixed_page() {
    let server = RequestServer::new(ServerConfig::default(), basic_page);
    let (handle, port) = running(&server).await;

    let response = get(port, "/nothing").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Type: text/html; charset=utf-8\r\n"));
    assert!(response.contains("Server: ExampleHttpServer\r\n"));
    assert!(response.contains(&format!("Content-Length: {}\r\n", THE_PAGE.len())));
    assert!(response.ends_with(THE_PAGE));

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_sees_raw_request_line() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let server = RequestServer::new(ServerConfig::default(), move |line: &str| {
        recorder.lock().unwrap().push(line.to_string());
        basic_page(line)
    });
    let (handle, port) = running(&server).await;

    get(port, "/nothing?withsomething=true").await;
    get(port, "/nothing#somelink").await;

    assert_eq!(
        *seen.lock().unwrap(),
        [
            "GET /nothing?withsomething=true HTTP/1.1",
            "GET /nothing#somelink HTTP/1.1"
        ]
    );
    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_exit_answers_then_stops() {
    let server = RequestServer::new(ServerConfig::default(), basic_page);
    let (handle, port) = running(&server).await;

    let response = get(port, "/exit").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with(THE_PAGE));

    let state = tokio::time::timeout(WAIT, server.block_until_stopped())
        .await
        .unwrap();
    assert_eq!(state, ServerState::Stopped);
    handle.await.unwrap().unwrap();

    // Listener is gone
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn test_handler_error_abandons_connection_and_continues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = RequestServer::new(ServerConfig::default(), move |line: &str| {
        counter.fetch_add(1, Ordering::Relaxed);
        if line.contains("/broken") {
            Err(HandlerError::Failed("template missing".to_string()))
        } else {
            basic_page(line)
        }
    });
    let (handle, port) = running(&server).await;

    assert_eq!(get(port, "/broken").await, "");
    assert!(get(port, "/fine").await.ends_with(THE_PAGE));
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    assert_eq!(server.state(), ServerState::Listening);

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_panic_abandons_connection_and_continues() {
    let server = RequestServer::new(ServerConfig::default(), |line: &str| {
        assert!(!line.contains("/boom"), "page renderer exploded");
        basic_page(line)
    });
    let (handle, port) = running(&server).await;

    assert_eq!(get(port, "/boom").await, "");
    assert_eq!(server.state(), ServerState::Listening);
    assert!(get(port, "/fine").await.ends_with(THE_PAGE));

    server.stop();
    let state = tokio::time::timeout(WAIT, server.block_until_stopped())
        .await
        .unwrap();
    assert_eq!(state, ServerState::Stopped);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_empty_connection_is_not_fatal() {
    let server = RequestServer::new(
        ServerConfig::default().with_read_retry_delay(Duration::from_millis(1)),
        basic_page,
    );
    let (handle, port) = running(&server).await;

    // Connect and hang up without a request line
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    drop(stream);

    assert!(get(port, "/after").await.ends_with(THE_PAGE));

    server.stop();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_interrupts_stalled_client() {
    let server = RequestServer::new(ServerConfig::default(), basic_page);
    let (handle, port) = running(&server).await;

    // Sends a request line but never finishes the headers
    let mut stalled = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stalled.write_all(b"GET /slow HTTP/1.1\r\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.stop();
    tokio::time::timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}
