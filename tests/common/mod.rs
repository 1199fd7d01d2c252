//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capture_proxy::config::ProxyConfig;
use capture_proxy::http::HttpServer;
use capture_proxy::lifecycle::Shutdown;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A request as a mock server saw it on the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_proxy_headers(&self) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.to_ascii_lowercase().starts_with("proxy-"))
    }
}

pub type Recorded = Arc<Mutex<Vec<RecordedRequest>>>;

/// Start the proxy on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let (addr, shutdown, _) = start_reloadable_proxy(config).await;
    (addr, shutdown)
}

/// Start the proxy and keep the sender its configuration updates arrive on.
pub async fn start_reloadable_proxy(
    config: ProxyConfig,
) -> (SocketAddr, Shutdown, mpsc::UnboundedSender<ProxyConfig>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let (updates, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(config);

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    (addr, shutdown, updates)
}

/// A reqwest client that sends every plain-HTTP request through `proxy`.
pub fn proxied_client(proxy: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).unwrap())
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}

/// Start a mock HTTP server. `respond` maps each request to the raw bytes
/// written back before the connection is closed.
pub async fn start_mock<F>(respond: F) -> (SocketAddr, Recorded)
where
    F: Fn(&RecordedRequest) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let log = recorded.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let reply = respond(&request);
                log.lock().unwrap().push(request);
                let _ = socket.write_all(&reply).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, recorded)
}

/// An origin answering every request with `200 OK` and `body`.
pub async fn start_origin(body: &'static [u8]) -> (SocketAddr, Recorded) {
    start_mock(move |_| ok_response(body, &[])).await
}

/// `200 OK` with a content length, extra headers and `body`.
pub fn ok_response(body: &[u8], extra_headers: &[(&str, &str)]) -> Vec<u8> {
    let mut head = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    for (name, value) in extra_headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");

    let mut reply = head.into_bytes();
    reply.extend_from_slice(body);
    reply
}

/// `407` challenge from an upstream proxy.
pub fn challenge_response() -> Vec<u8> {
    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
      Proxy-Authenticate: Basic realm=\"upstream\"\r\n\
      Content-Length: 6\r\n\
      Connection: close\r\n\r\n\
      denied"
        .to_vec()
}

/// An origin that promises `declared` bytes, sends `sent` of them and hangs up.
pub async fn start_truncating_origin(declared: usize, sent: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_none() {
                    return;
                }
                let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\n\r\n");
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&vec![b'x'; sent]).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(socket);
            });
        }
    });

    addr
}

/// A TCP server that echoes every byte back.
pub async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// An upstream proxy that answers CONNECT with `status`; on 200 it connects
/// to the requested target and relays.
pub async fn start_connect_upstream(status: u16) -> (SocketAddr, Recorded) {
    start_connect_upstream_with_greeting(status, b"").await
}

/// Like [`start_connect_upstream`], but writes `greeting` in the same write as
/// its 200, ahead of any relayed byte.
pub async fn start_connect_upstream_with_greeting(
    status: u16,
    greeting: &'static [u8],
) -> (SocketAddr, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));

    let log = recorded.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let target = request
                    .request_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                log.lock().unwrap().push(request);

                if status != 200 {
                    let reply = format!("HTTP/1.1 {status} Nope\r\nContent-Length: 0\r\n\r\n");
                    let _ = socket.write_all(reply.as_bytes()).await;
                    return;
                }

                let Ok(mut outbound) = TcpStream::connect(target).await else {
                    return;
                };
                let mut reply = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
                reply.extend_from_slice(greeting);
                let _ = socket.write_all(&reply).await;
                let _ = tokio::io::copy_bidirectional(&mut socket, &mut outbound).await;
            });
        }
    });

    (addr, recorded)
}

/// Read one HTTP/1.1 request: head plus a content-length or chunked body.
pub async fn read_request(socket: &mut TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut request = RecordedRequest {
        request_line,
        headers,
        body: Vec::new(),
    };
    let mut rest = buf[head_end + 4..].to_vec();

    if let Some(len) = request.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while rest.len() < len {
            let mut chunk = [0u8; 4096];
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&chunk[..n]);
        }
        rest.truncate(len);
        request.body = rest;
    } else if request
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        while find(&rest, b"0\r\n\r\n").is_none() {
            let mut chunk = [0u8; 4096];
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&chunk[..n]);
        }
        request.body = decode_chunked(&rest);
    }

    Some(request)
}

fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    while let Some(line_end) = find(data, b"\r\n") {
        let size_line = String::from_utf8_lossy(&data[..line_end]);
        let size = usize::from_str_radix(size_line.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        body.extend_from_slice(&data[start..start + size]);
        data = &data[start + size + 2..];
    }
    body
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read from `socket` until `expected` bytes have arrived.
pub async fn read_exact_len(socket: &mut TcpStream, expected: usize) -> Vec<u8> {
    let mut buf = vec![0u8; expected];
    tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut buf))
        .await
        .expect("timed out waiting for tunnel bytes")
        .unwrap();
    buf
}

/// Read a response head (through the blank line) from a raw socket.
pub async fn read_response_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut byte))
            .await
            .expect("timed out waiting for response head")
            .unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Poll `check` every 50ms until it holds or `timeout` elapses.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}
