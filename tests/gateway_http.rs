//! End-to-end gateway tests over real TCP sockets.
//!
//! Each test binds a gateway on an ephemeral loopback port, talks raw
//! HTTP/1.1 (or WebSocket frames) to it, and tears it down via the running
//! flag. Upstream providers are mocked with a minimal SSE server.

use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use portico::config::Config;
use portico::gateway::{AppContext, Gateway};

struct TestServer {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    ctx: Arc<AppContext>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn test_config() -> Config {
    Config {
        gateway_bind: "127.0.0.1".into(),
        gateway_port: 0,
        session_db_path: Some(":memory:".into()),
        anthropic_api_key: None,
        openai_api_key: None,
        ..Config::default()
    }
}

fn spawn_gateway(config: Config) -> TestServer {
    let ctx = AppContext::new(config).expect("context");
    let gateway = Gateway::bind(ctx).expect("bind");
    let addr = gateway.local_addr();
    let running = gateway.running_flag();
    let ctx = gateway.context();
    let handle = std::thread::spawn(move || {
        let _ = gateway.run();
    });
    TestServer {
        addr,
        running,
        ctx,
        handle: Some(handle),
    }
}

// ── Raw HTTP client helpers ─────────────────────────────────────────────────

struct HttpReply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl HttpReply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("JSON body")
    }
}

fn read_reply(stream: &mut TcpStream) -> HttpReply {
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).expect("read response headers");
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line.split(' ').nth(1).expect("code").parse().unwrap();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).expect("read response body");
        assert!(n > 0, "connection closed before body completed");
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    HttpReply {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

fn request(addr: SocketAddr, raw: &str) -> HttpReply {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream.write_all(raw.as_bytes()).expect("send request");
    read_reply(&mut stream)
}

fn post_json(addr: SocketAddr, path: &str, body: &str, extra_headers: &str) -> HttpReply {
    let raw = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n{extra_headers}Content-Length: {}\r\n\r\n{body}",
        body.len()
    );
    request(addr, &raw)
}

// ── Mock upstream ───────────────────────────────────────────────────────────

struct MockUpstream {
    base_url: String,
    handle: Option<JoinHandle<()>>,
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Serve `connections` upstream requests, each answered with `status` and
/// `body` after the full request has been consumed.
fn mock_upstream(status: u16, body: &'static str, connections: usize) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").expect("mock bind");
    let addr = listener.local_addr().unwrap();

    let handle = std::thread::spawn(move || {
        for _ in 0..connections {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            consume_request(&mut stream);

            let reply = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Type: text/event-stream\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(reply.as_bytes());
        }
    });

    MockUpstream {
        base_url: format!("http://{addr}"),
        handle: Some(handle),
    }
}

fn consume_request(stream: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).expect("mock read");
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);

    let mut have = buf.len() - (header_end + 4);
    while have < content_length {
        let n = stream.read(&mut chunk).expect("mock read body");
        assert!(n > 0);
        have += n;
    }
}

const PONG_SSE: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet\",\"usage\":{\"input_tokens\":3}}}\n\n",
    "event: content_block_delta\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"pong\"}}\n\n",
    "event: message_delta\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
    "event: message_stop\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn health_probe() {
    let server = spawn_gateway(test_config());
    let reply = request(server.addr, "GET /health HTTP/1.1\r\nHost: x\r\n\r\n");

    assert_eq!(reply.status, 200);
    let json = reply.json();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    assert!(json["uptime_seconds"].as_u64().is_some());
    assert_eq!(json["total_requests"], 1);
    assert_eq!(reply.header("Access-Control-Allow-Origin"), Some("*"));
}

#[test]
fn cors_preflight() {
    let server = spawn_gateway(test_config());
    let reply = request(
        server.addr,
        "OPTIONS /v1/chat/completions HTTP/1.1\r\nHost: x\r\nOrigin: http://local\r\n\r\n",
    );

    assert_eq!(reply.status, 204);
    assert_eq!(reply.header("Access-Control-Allow-Origin"), Some("*"));
    assert!(reply
        .header("Access-Control-Allow-Methods")
        .unwrap()
        .contains("POST"));
    assert!(reply.body.is_empty());
}

#[test]
fn unknown_route_is_404() {
    let server = spawn_gateway(test_config());
    let reply = request(server.addr, "GET /nope HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 404);
    assert_eq!(reply.json()["error"], "Not Found");
    assert_eq!(reply.header("Access-Control-Allow-Origin"), Some("*"));
}

#[test]
fn webhook_missing_message_field() {
    let server = spawn_gateway(test_config());
    let reply = post_json(server.addr, "/hooks/webchat", "{}", "");
    assert_eq!(reply.status, 400);
    assert_eq!(reply.json()["error"], "Missing 'message' field");
}

#[test]
fn chat_without_key_is_500() {
    let server = spawn_gateway(test_config());
    let reply = post_json(
        server.addr,
        "/v1/chat/completions",
        r#"{"model":"claude-3-5-sonnet","messages":[{"role":"user","content":"ping"}]}"#,
        "",
    );
    assert_eq!(reply.status, 500);
    let json = reply.json();
    assert_eq!(json["error"]["message"], "No API key configured");
    assert_eq!(json["error"]["type"], "server_error");
}

#[test]
fn chat_upstream_failure_is_502() {
    let upstream = mock_upstream(503, "overloaded", 1);
    let config = Config {
        anthropic_api_key: Some("test-key".into()),
        anthropic_base_url: upstream.base_url.clone(),
        ..test_config()
    };
    let server = spawn_gateway(config);

    let reply = post_json(
        server.addr,
        "/v1/chat/completions",
        r#"{"model":"claude-3-5-sonnet","messages":[{"role":"user","content":"ping"}]}"#,
        "",
    );
    assert_eq!(reply.status, 502);
    let json = reply.json();
    assert_eq!(json["error"]["message"], "AI API request failed");
    assert_eq!(json["error"]["type"], "server_error");
}

#[test]
fn chat_happy_path_streams_and_aggregates() {
    let upstream = mock_upstream(200, PONG_SSE, 1);
    let config = Config {
        anthropic_api_key: Some("test-key".into()),
        anthropic_base_url: upstream.base_url.clone(),
        ..test_config()
    };
    let server = spawn_gateway(config);

    let reply = post_json(
        server.addr,
        "/v1/chat/completions",
        r#"{"model":"claude-3-5-sonnet","messages":[{"role":"user","content":"ping"}]}"#,
        "",
    );

    assert_eq!(reply.status, 200);
    let json = reply.json();
    assert_eq!(json["object"], "chat.completion");
    assert_eq!(json["model"], "claude-3-5-sonnet");
    assert_eq!(json["choices"][0]["message"]["content"], "pong");
    assert_eq!(json["choices"][0]["message"]["role"], "assistant");
    assert_eq!(json["choices"][0]["finish_reason"], "stop");
    assert_eq!(json["usage"]["prompt_tokens"], 3);
    assert_eq!(json["usage"]["completion_tokens"], 2);
    assert_eq!(json["usage"]["total_tokens"], 5);
    assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
}

#[test]
fn webhook_with_session_echoes_session_id() {
    let upstream = mock_upstream(200, PONG_SSE, 1);
    let config = Config {
        anthropic_api_key: Some("test-key".into()),
        anthropic_base_url: upstream.base_url.clone(),
        ..test_config()
    };
    let server = spawn_gateway(config);

    let reply = post_json(
        server.addr,
        "/hooks/webchat",
        r#"{"message":"ping","session_id":"cafebabecafebabecafebabecafebabe"}"#,
        "",
    );

    assert_eq!(reply.status, 200);
    let json = reply.json();
    assert_eq!(json["response"], "pong");
    assert_eq!(json["session_id"], "cafebabecafebabecafebabecafebabe");
    assert!(json["model"].as_str().is_some());

    // Both sides of the turn were persisted under the session
    let count = server
        .ctx
        .store
        .count_session_messages("cafebabecafebabecafebabecafebabe")
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn bearer_auth_guards_routes_but_not_health() {
    let config = Config {
        auth_token: Some("sekrit".into()),
        ..test_config()
    };
    let server = spawn_gateway(config);

    // Health stays open
    let reply = request(server.addr, "GET /health HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(reply.status, 200);

    // Missing token
    let reply = post_json(server.addr, "/hooks/webchat", r#"{"message":"hi"}"#, "");
    assert_eq!(reply.status, 401);
    assert_eq!(reply.json()["error"], "Unauthorized");

    // Wrong token
    let reply = post_json(
        server.addr,
        "/hooks/webchat",
        r#"{"message":"hi"}"#,
        "Authorization: Bearer wrong\r\n",
    );
    assert_eq!(reply.status, 401);

    // Correct token reaches the handler (which then fails on missing key)
    let reply = post_json(
        server.addr,
        "/hooks/webchat",
        r#"{"message":"hi"}"#,
        "Authorization: Bearer sekrit\r\n",
    );
    assert_eq!(reply.status, 500);
    assert_eq!(reply.json()["error"], "No API key configured");
}

#[test]
fn keep_alive_serves_sequential_requests() {
    let server = spawn_gateway(test_config());
    let mut stream = TcpStream::connect(server.addr).unwrap();

    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let first = read_reply(&mut stream);
    assert_eq!(first.status, 200);
    assert_eq!(first.json()["total_requests"], 1);

    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let second = read_reply(&mut stream);
    assert_eq!(second.status, 200);
    assert_eq!(second.json()["total_requests"], 2);
}

#[test]
fn connection_close_header_is_honored() {
    let server = spawn_gateway(test_config());
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let reply = read_reply(&mut stream);
    assert_eq!(reply.status, 200);

    // Server closes; the next read sees EOF
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).unwrap();
    assert_eq!(n, 0);
}

// ── WebSocket ───────────────────────────────────────────────────────────────

fn masked_text_frame(payload: &[u8], key: [u8; 4]) -> Vec<u8> {
    assert!(payload.len() < 126);
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read frame");
    buf
}

#[test]
fn websocket_echo_round_trip() {
    let server = spawn_gateway(test_config());
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    // Handshake reply
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8_lossy(&buf);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(head.contains("Upgrade: websocket\r\n"));

    // Masked text frame "hi" in, unmasked "hi" back
    stream
        .write_all(&masked_text_frame(b"hi", [0x11, 0x22, 0x33, 0x44]))
        .unwrap();

    let header = read_exact(&mut stream, 2);
    assert_eq!(header[0], 0x81); // FIN + text
    assert_eq!(header[1], 2); // unmasked, length 2
    let payload = read_exact(&mut stream, 2);
    assert_eq!(&payload, b"hi");

    // The upgrade created a session and the exchange was persisted
    assert_eq!(server.ctx.store.count_sessions().unwrap(), 1);
    assert_eq!(server.ctx.store.count_messages().unwrap(), 2);

    // Close frame terminates the connection
    let close = [0x88, 0x80, 0, 0, 0, 0];
    stream.write_all(&close).unwrap();
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest); // close reply then EOF
}

#[test]
fn websocket_ping_gets_pong() {
    let server = spawn_gateway(test_config());
    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    }

    // Masked ping with payload "p"
    let mut ping = vec![0x89, 0x81, 1, 2, 3, 4];
    ping.push(b'p' ^ 1);
    stream.write_all(&ping).unwrap();

    let header = read_exact(&mut stream, 2);
    assert_eq!(header[0], 0x8A); // FIN + pong
    assert_eq!(header[1], 1);
    assert_eq!(read_exact(&mut stream, 1), b"p");
}
