/// Fuzzy tests for depot server reliability
///
/// These tests verify server robustness against malformed, unexpected,
/// or malicious inputs to ensure stability and security.
mod common;

use bytes::Bytes;
use common::TestDepot;
use http::{Method, StatusCode};
use rand::Rng;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tunnel_depot::tls;
use tunnel_depot::wire::{send_body, VERSION_HEADER};

async fn connect_tls(port: u16) -> TlsStream<TcpStream> {
    let connector =
        TlsConnector::from(tls::load_client_config(None, None).expect("client TLS config"));
    let tcp_stream = TcpStream::connect(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to connect");
    let server_name = ServerName::try_from("localhost").unwrap().to_owned();
    connector
        .connect(server_name, tcp_stream)
        .await
        .expect("TLS handshake failed")
}

/// Raw HTTP/2 session without the depot client in between
async fn connect_h2(port: u16) -> h2::client::SendRequest<Bytes> {
    let tls_stream = connect_tls(port).await;
    let (send_request, connection) = h2::client::handshake(tls_stream)
        .await
        .expect("HTTP/2 handshake failed");
    tokio::spawn(async move {
        let _ = connection.await;
    });
    send_request.ready().await.expect("connection not ready")
}

fn put_request(path: &str, content_length: Option<usize>) -> http::Request<()> {
    let mut builder = http::Request::builder()
        .method(Method::PUT)
        .uri(format!("https://localhost{}", path))
        .header(VERSION_HEADER, "1");
    if let Some(len) = content_length {
        builder = builder.header(http::header::CONTENT_LENGTH, len);
    }
    builder.body(()).unwrap()
}

/// Drain whatever the server sends until it closes the connection
async fn drain(stream: &mut TlsStream<TcpStream>) {
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
}

/// Wait until the audit log holds at least `count` records mentioning `needle`
async fn wait_for_audit(depot: &TestDepot, needle: &str, count: usize) -> Vec<serde_json::Value> {
    let path = depot.store_dir().join("audit.log");
    let mut matching = Vec::new();
    for _ in 0..50 {
        let audit = std::fs::read_to_string(&path).unwrap_or_default();
        matching = audit
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|record| record.to_string().contains(needle))
            .collect();
        if matching.len() >= count {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    matching
}

/// The server must still answer real requests
async fn assert_still_serving(depot: &TestDepot) {
    let user = depot
        .anonymous()
        .new_user("survivor", false)
        .await
        .expect("Server stopped serving");
    assert_eq!(user.name, "survivor");
}

/// 测试在 TLS 之上发送非 HTTP/2 数据
#[tokio::test]
async fn test_garbage_instead_of_http2_preface() {
    let depot = TestDepot::start().await;

    let garbage = [
        "GARBAGE\r\n\r\n",
        "GET /store HTTP/1.1\r\nhost: localhost\r\n\r\n",
        "PRI * HTTP/2.0\r\n\r\nXX\r\n\r\n",
        "\r\n\r\n",
    ];
    for payload in garbage {
        let mut stream = connect_tls(depot.port).await;
        stream.write_all(payload.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
        let _ = stream.shutdown().await;
        drain(&mut stream).await;
    }

    // 每条无法解析的连接都留下一条审计记录
    let records = wait_for_audit(&depot, "malformed request", garbage.len()).await;
    assert_eq!(records.len(), garbage.len());
    for record in &records {
        assert_eq!(record["level"], "warning");
        assert!(record["client"].as_str().unwrap().starts_with("127.0.0.1:"));
        assert!(record["comment"].as_str().unwrap().contains("HTTP/2"));
    }

    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试声明长度超限的请求体
#[tokio::test]
async fn test_declared_body_over_limit() {
    let depot = TestDepot::start().await;
    let mut session = connect_h2(depot.port).await;

    // 声明的长度超过上限：不读取请求体直接拒绝
    let request = put_request("/store/big.ini", Some(depot.config.max_body_size + 1));
    let (response, _body) = session.send_request(request, false).unwrap();
    let response = timeout(Duration::from_secs(5), response)
        .await
        .expect("no response to oversized declaration")
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let records = wait_for_audit(&depot, "malformed request", 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["method"], "PUT");
    assert_eq!(records[0]["path"], "/store/big.ini");
    assert!(records[0]["comment"].as_str().unwrap().contains("exceeds limit"));

    assert!(!depot.data_dir().join("big.ini").exists());
    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试未声明长度、实际超限的请求体
#[tokio::test]
async fn test_streamed_body_over_limit() {
    let depot = TestDepot::start().await;
    let mut session = connect_h2(depot.port).await;

    let request = put_request("/store/big.ini", None);
    let (response, mut body) = session.send_request(request, false).unwrap();
    let payload = Bytes::from(vec![b'x'; depot.config.max_body_size + 1]);
    // 服务器超限后不再读取，发送可能中途失败
    let _ = timeout(Duration::from_secs(5), send_body(&mut body, payload)).await;

    if let Ok(Ok(response)) = timeout(Duration::from_secs(5), response).await {
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    let records = wait_for_audit(&depot, "exceeds limit", 1).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["path"], "/store/big.ini");

    assert!(!depot.data_dir().join("big.ini").exists());
    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试超长请求头
#[tokio::test]
async fn test_oversized_headers() {
    let depot = TestDepot::start().await;
    let mut session = connect_h2(depot.port).await;

    let request = http::Request::builder()
        .method(Method::GET)
        .uri("https://localhost/store")
        .header(VERSION_HEADER, "1")
        .header("x-padding", "a".repeat(64 * 1024))
        .body(())
        .unwrap();

    // 客户端可能拒绝发送，服务器也可能重置流或答复 431
    if let Ok((response, _)) = session.send_request(request, true) {
        if let Ok(Ok(response)) = timeout(Duration::from_secs(5), response).await {
            assert_ne!(response.status(), StatusCode::OK);
        }
    }

    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试快速连接和断开
#[tokio::test]
async fn test_rapid_connect_disconnect() {
    let depot = TestDepot::start().await;

    // 快速连接和断开 50 次
    for _ in 0..50 {
        let result = timeout(
            Duration::from_millis(500),
            TcpStream::connect(format!("127.0.0.1:{}", depot.port)),
        )
        .await;

        if let Ok(Ok(stream)) = result {
            drop(stream); // 立即断开
        }
    }

    sleep(Duration::from_millis(200)).await;
    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试明文（非 TLS）数据
#[tokio::test]
async fn test_plaintext_instead_of_tls() {
    let depot = TestDepot::start().await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", depot.port))
        .await
        .unwrap();
    let _ = stream
        .write_all(b"GET /store HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await;
    let mut buf = [0u8; 256];
    let _ = timeout(Duration::from_secs(2), stream.read(&mut buf)).await;
    drop(stream);

    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试随机数据注入
#[tokio::test]
async fn test_random_data_injection() {
    let depot = TestDepot::start().await;

    let payloads: Vec<Vec<u8>> = {
        let mut rng = rand::rng();
        (0..20)
            .map(|_| {
                let len = rng.random_range(1..1000);
                (0..len).map(|_| rng.random()).collect()
            })
            .collect()
    };

    for payload in payloads {
        let mut stream = connect_tls(depot.port).await;
        let _ = stream.write_all(&payload).await;
        let _ = stream.flush().await;
        let _ = stream.shutdown().await;
        drain(&mut stream).await;
    }

    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试同一 HTTP/2 连接上的并发流
#[tokio::test]
async fn test_concurrent_streams_on_one_connection() {
    let depot = TestDepot::start().await;
    let session = connect_h2(depot.port).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let mut session = session.clone();
        handles.push(tokio::spawn(async move {
            let request = http::Request::builder()
                .method(Method::GET)
                .uri("https://localhost/store")
                .header(VERSION_HEADER, "1")
                .body(())
                .unwrap();
            session = session.ready().await.unwrap();
            let (response, _) = session.send_request(request, true).unwrap();
            response.await.unwrap().status()
        }));
    }
    // 无客户端证书：每个流都独立得到 403
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::FORBIDDEN);
    }

    assert_still_serving(&depot).await;
    depot.stop().await;
}

/// 测试并发请求
#[tokio::test]
async fn test_concurrent_requests() {
    let depot = TestDepot::start().await;
    let alice = depot.enroll(&depot.anonymous(), "alice", false).await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let client = alice.clone();
        handles.push(tokio::spawn(async move { client.list().await }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_empty());
    }

    depot.stop().await;
}
