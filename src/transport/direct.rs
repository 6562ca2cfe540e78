//! Direct HTTP/1.1 transport over a TCP connection to the endpoint.
//!
//! Endpoints run plain selenium servers and a small agent, both speaking
//! HTTP on fixed ports. Requests here are short-lived one-shot exchanges,
//! so a fresh connection per request keeps the implementation simple and
//! sidesteps keep-alive state on half-dead endpoints.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{Transport, TransportError, TransportResult, WireRequest, WireResponse};

/// One-shot HTTP/1.1 client for endpoint selenium/agent ports.
pub struct DirectTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl DirectTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

impl Default for DirectTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(300))
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn send(&self, host: &str, request: &WireRequest) -> TransportResult<WireResponse> {
        let addr = format!("{}:{}", host, request.port);
        debug!("{} {} -> {}", request.method, request.url, addr);

        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", addr)))?
            .map_err(|e| TransportError::Connection(format!("{}: {}", addr, e)))?;

        stream
            .write_all(render_request(host, request).as_bytes())
            .await
            .map_err(|e| TransportError::Connection(format!("write to {}: {}", addr, e)))?;

        let mut raw = Vec::new();
        tokio::time::timeout(self.read_timeout, stream.read_to_end(&mut raw))
            .await
            .map_err(|_| TransportError::Timeout(format!("read from {}", addr)))?
            .map_err(|e| TransportError::Connection(format!("read from {}: {}", addr, e)))?;

        parse_response(&raw)
    }
}

fn render_request(host: &str, request: &WireRequest) -> String {
    let mut out = format!("{} {} HTTP/1.1\r\n", request.method, request.url);
    out.push_str(&format!("Host: {}:{}\r\n", host, request.port));
    out.push_str("Connection: close\r\n");
    for (key, value) in &request.headers {
        // Length and connection handling is ours, not the caller's.
        if key.eq_ignore_ascii_case("content-length") || key.eq_ignore_ascii_case("connection") {
            continue;
        }
        out.push_str(&format!("{}: {}\r\n", key, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", request.data.len()));
    out.push_str(&request.data);
    out
}

fn parse_response(raw: &[u8]) -> TransportResult<WireResponse> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| TransportError::BadResponse("missing header terminator".to_string()))?;

    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| TransportError::BadResponse("empty response".to_string()))?;

    // "HTTP/1.1 200 OK"
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TransportError::BadResponse(format!("bad status line: {}", status_line)))?;

    let mut headers = std::collections::HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(WireResponse {
        status,
        headers,
        content: body.to_string(),
    })
}
