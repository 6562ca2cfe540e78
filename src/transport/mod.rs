//! Request transports between the proxy and allocated endpoints.
//!
//! Two transports exist: [`direct::DirectTransport`] speaks HTTP/1.1
//! straight to the endpoint's selenium/agent port, and
//! [`queue::QueueTransport`] publishes correlation-tagged frames to a
//! remote provider process and matches the responses back.

pub mod direct;
pub mod queue;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while forwarding a request to an endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("malformed response: {0}")]
    BadResponse(String),

    #[error("client disconnected: {0}")]
    ClientDisconnected(String),

    #[error("no consumer for channel: {0}")]
    NoConsumer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An HTTP request on the wire to an endpoint.
///
/// This is the queue payload shape: `{"method", "url", "port", "headers",
/// "data"}`. The direct transport renders the same fields as HTTP/1.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    pub port: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: String,
}

impl WireRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>, port: u16) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            port,
            headers: HashMap::new(),
            data: String::new(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn body(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

/// Response payload shape: `{"status", "headers", "content"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub content: String,
}

impl WireResponse {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            content: content.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Carries a request to an endpoint's address and returns the response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a single request to `host` and await the response. One attempt;
    /// retry budgeting lives in the proxy.
    async fn send(&self, host: &str, request: &WireRequest) -> TransportResult<WireResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_request_roundtrips_through_json() {
        let req = WireRequest::new("POST", "/wd/hub/session", 4455)
            .header("Content-Type", "application/json")
            .body(r#"{"desiredCapabilities":{}}"#);

        let json = serde_json::to_string(&req).unwrap();
        let back: WireRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method, "POST");
        assert_eq!(back.port, 4455);
        assert_eq!(back.headers["Content-Type"], "application/json");
    }

    #[test]
    fn wire_response_success_range() {
        assert!(WireResponse::ok("").is_success());
        let err = WireResponse {
            status: 500,
            headers: HashMap::new(),
            content: String::new(),
        };
        assert!(!err.is_success());
    }
}
