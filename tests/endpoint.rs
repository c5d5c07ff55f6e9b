//! Drives the resolve endpoint over a real TCP connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dogpile::{BackingStoreError, MissCoordinator, Server, StampedeConfig, api};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    stop: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let coordinator = Arc::new(
            MissCoordinator::from_config(&StampedeConfig::default(), move |id: i64| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if id < 0 {
                        return Err(BackingStoreError::new("no such row"));
                    }
                    Ok(())
                }
            })
            .unwrap(),
        );

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            server
                .run_until(
                    move |req| {
                        let coordinator = Arc::clone(&coordinator);
                        async move { api::handle(&coordinator, req).await }
                    },
                    async {
                        let _ = stopped.await;
                    },
                )
                .await
                .unwrap();
        });

        Self {
            addr,
            calls,
            stop: Some(stop),
            task,
        }
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap();
    }
}

/// Sends one `Connection: close` request and returns (status, body).
async fn get(addr: SocketAddr, target: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status = raw[9..12].parse().unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_owned())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn resolve_then_cache_hit() {
    let server = TestServer::start().await;

    let (status, body) = get(server.addr, "/open_api/data/cache_through_test?id=42").await;
    assert_eq!(status, 200);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["message"], "success");
    assert_eq!(json["data"]["outcome"]["path"], "fetched");

    let (_, body) = get(server.addr, "/open_api/data/cache_through_test?id=42").await;
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["data"]["outcome"]["path"], "cache_hit");

    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn failing_lookup_returns_bad_gateway() {
    let server = TestServer::start().await;

    let (status, body) = get(server.addr, "/open_api/data/cache_through_test?id=-1").await;
    assert_eq!(status, 502);
    assert!(body.contains("no such row"));

    // Not cached, so the next request tries again.
    let (status, _) = get(server.addr, "/open_api/data/cache_through_test?id=-1").await;
    assert_eq!(status, 502);
    assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let server = TestServer::start().await;

    let (status, _) = get(server.addr, "/open_api/data/cache_through_test?id=x").await;
    assert_eq!(status, 400);
    let (status, _) = get(server.addr, "/elsewhere").await;
    assert_eq!(status, 404);

    assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let server = TestServer::start().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let requests = concat!(
        "GET /open_api/data/cache_through_test?id=5 HTTP/1.1\r\nHost: localhost\r\n\r\n",
        "GET /open_api/data/cache_through_test?id=5 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    stream.write_all(requests.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    assert_eq!(raw.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(raw.contains("\"fetched\""));
    assert!(raw.contains("\"cache_hit\""));
    assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    server.shutdown().await;
}

#[tokio::test]
async fn malformed_request_gets_400() {
    let server = TestServer::start().await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    stream.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    server.shutdown().await;
}
