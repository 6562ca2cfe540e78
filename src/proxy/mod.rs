//! WebDriver traffic between clients and allocated endpoints.
//!
//! The external session id is the only id a client ever sees. On the way
//! in, [`SessionRequestProxy`] swaps it for the endpoint-native selenium
//! session id; on the way out it swaps back. Forwarding retries
//! transiently with a bounded attempt budget and observes the session's
//! closed latch at every retry boundary, so a concurrent close aborts the
//! loop instead of completing a stale operation.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::artifacts::ArtifactCollector;
use crate::endpoint::Endpoint;
use crate::error::CreationError;
use crate::session::{Session, SessionStatus};
use crate::transport::{Transport, TransportError, WireRequest, WireResponse};

/// Selenium JSONWireProtocol error codes the proxy emits itself.
pub const STATUS_UNKNOWN_ERROR: i64 = 13;
pub const STATUS_SESSION_NOT_CREATED: i64 = 33;

/// JSONWire error body: `{"status": <int>, "value": {"message": <str>}}`.
pub fn webdriver_error(status: i64, message: &str) -> Value {
    json!({ "status": status, "value": { "message": message } })
}

/// Session id as it appears in a `/wd/hub/session/{id}/...` path.
fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/wd/hub/session/([^/\s]+)").unwrap())
}

/// Extract the session id segment from a WebDriver path, if present.
pub fn session_id_from_path(path: &str) -> Option<&str> {
    session_id_pattern()
        .captures(path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Deadline of the initial reachability stage.
    pub ping_timeout: Duration,
    /// Attempt budget for one forwarded request, status check, or
    /// session start.
    pub make_request_attempts: u32,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(180),
            make_request_attempts: 3,
        }
    }
}

/// Forwards WebDriver requests from a session to its endpoint.
pub struct SessionRequestProxy {
    transport: Arc<dyn Transport>,
    collector: Arc<ArtifactCollector>,
    settings: ProxySettings,
}

impl SessionRequestProxy {
    pub fn new(
        transport: Arc<dyn Transport>,
        collector: Arc<ArtifactCollector>,
        settings: ProxySettings,
    ) -> Self {
        Self {
            transport,
            collector,
            settings,
        }
    }

    /// Forward one request with the attempt budget and linear backoff.
    /// The session's closed latch is checked before every attempt. A
    /// client-disconnect notice from the transport closes the session and
    /// aborts immediately; disconnects are torn down, never retried.
    pub async fn make_request(
        &self,
        session: &Session,
        host: &str,
        request: &WireRequest,
    ) -> Result<WireResponse, CreationError> {
        let attempts = self.settings.make_request_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if session.is_closed() {
                return Err(CreationError::SessionClosed(session.id));
            }

            match self.transport.send(host, request).await {
                Ok(response) => {
                    session.touch();
                    return Ok(response);
                }
                Err(TransportError::ClientDisconnected(reason)) => {
                    info!("client of session {} disconnected: {}", session.id, reason);
                    session.failed(format!("client disconnected: {}", reason));
                    return Err(CreationError::SessionClosed(session.id));
                }
                Err(e) => {
                    debug!(
                        "attempt {}/{} to {}{} failed: {}",
                        attempt, attempts, host, request.url, e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(500) * attempt).await;
            }
        }

        Err(CreationError::RequestFailed {
            host: host.to_string(),
            attempts,
            reason: last_error,
        })
    }

    /// Run the fixed startup sequence against a freshly allocated
    /// endpoint: reachability, selenium status, optional startup script,
    /// then the remote session start. Stage order never changes and no
    /// stage is skipped; every stage aborts early if the session was
    /// closed concurrently.
    pub async fn start_session(
        &self,
        session: &Arc<Session>,
        endpoint: &Arc<Endpoint>,
        startup_script: Option<&str>,
    ) -> Result<WireResponse, CreationError> {
        session.set_status(SessionStatus::Preparing);

        self.ping_endpoint(session, endpoint).await?;
        self.selenium_status(session, endpoint).await?;
        if let Some(script) = startup_script {
            self.run_script(session, endpoint, script).await?;
        }
        let response = self.start_selenium_session(session, endpoint).await?;

        session.run();
        info!(
            "session {} running on {} as {}",
            session.id,
            endpoint.name,
            session.selenium_session().unwrap_or_default()
        );
        Ok(response)
    }

    /// Wait until the endpoint answers on all required ports, bounded by
    /// `ping_timeout`.
    async fn ping_endpoint(
        &self,
        session: &Session,
        endpoint: &Arc<Endpoint>,
    ) -> Result<(), CreationError> {
        let deadline = Instant::now() + self.settings.ping_timeout;
        loop {
            if session.is_closed() {
                return Err(CreationError::SessionClosed(session.id));
            }
            if endpoint.ping_once().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CreationError::PingTimeout {
                    endpoint: endpoint.name.clone(),
                    timeout_secs: self.settings.ping_timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn selenium_status(
        &self,
        session: &Session,
        endpoint: &Arc<Endpoint>,
    ) -> Result<(), CreationError> {
        let (host, port) = selenium_target(endpoint)?;
        let request = WireRequest::new("GET", "/wd/hub/status", port);

        let response = self.make_request(session, &host, &request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(CreationError::StatusFailed {
                endpoint: endpoint.name.clone(),
                attempts: self.settings.make_request_attempts,
                reason: format!("status {}: {}", response.status, response.content),
            })
        }
    }

    /// Run a script inside the endpoint through its agent port.
    pub async fn run_script(
        &self,
        session: &Session,
        endpoint: &Arc<Endpoint>,
        script: &str,
    ) -> Result<WireResponse, CreationError> {
        let addr = endpoint
            .addr()
            .ok_or_else(|| CreationError::ScriptFailed {
                endpoint: endpoint.name.clone(),
                reason: "endpoint has no address".into(),
            })?;

        let request = WireRequest::new("POST", "/runScript", addr.agent_port)
            .header("Content-Type", "application/json")
            .body(json!({ "script": script }).to_string());

        let response = self.make_request(session, &addr.ip, &request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(CreationError::ScriptFailed {
                endpoint: endpoint.name.clone(),
                reason: format!("status {}: {}", response.status, response.content),
            })
        }
    }

    async fn start_selenium_session(
        &self,
        session: &Arc<Session>,
        endpoint: &Arc<Endpoint>,
    ) -> Result<WireResponse, CreationError> {
        let (host, port) = selenium_target(endpoint)?;
        let body = json!({ "desiredCapabilities": session.desired_capabilities });
        let request = WireRequest::new("POST", "/wd/hub/session", port)
            .header("Content-Type", "application/json")
            .body(body.to_string());

        let response = self.make_request(session, &host, &request).await?;
        if !response.is_success() {
            return Err(CreationError::SessionStartFailed {
                endpoint: endpoint.name.clone(),
                reason: format!("status {}: {}", response.status, response.content),
            });
        }

        let native_id = extract_selenium_session_id(&response.content).ok_or_else(|| {
            CreationError::SessionStartFailed {
                endpoint: endpoint.name.clone(),
                reason: format!("no sessionId in response: {}", response.content),
            }
        })?;
        session.set_selenium_session(&native_id);

        Ok(substitute_response(response, &native_id, &session.id.to_string()))
    }

    /// Transparent forwarding for an established session: swap the
    /// external id for the native one, send, swap back.
    pub async fn proxy_request(
        &self,
        session: &Arc<Session>,
        endpoint: &Arc<Endpoint>,
        request: WireRequest,
    ) -> Result<WireResponse, CreationError> {
        let native_id =
            session
                .selenium_session()
                .ok_or_else(|| CreationError::SessionStartFailed {
                    endpoint: endpoint.name.clone(),
                    reason: "no selenium session established".into(),
                })?;
        let external_id = session.id.to_string();
        let (host, _) = selenium_target(endpoint)?;

        let inbound = substitute_request(request, &external_id, &native_id);
        let response = self.make_request(session, &host, &inbound).await?;

        if wants_screenshot(session, &inbound) {
            self.enqueue_screenshot(session, endpoint, &native_id);
        }

        Ok(substitute_response(response, &native_id, &external_id))
    }

    /// Fetch a screenshot from the endpoint in the background and store
    /// it with the session's artifacts.
    fn enqueue_screenshot(&self, session: &Arc<Session>, endpoint: &Arc<Endpoint>, native_id: &str) {
        let Ok((host, port)) = selenium_target(endpoint) else {
            return;
        };
        let transport = self.transport.clone();
        let url = format!("/wd/hub/session/{}/screenshot", native_id);
        let dir = self.collector.session_dir(session.id);
        let name = format!(
            "screenshot-{}",
            chrono::Utc::now().timestamp_millis()
        );
        let path = dir.join(format!("{}.png", name));

        self.collector.add_task(session.id, name, async move {
            let request = WireRequest::new("GET", &url, port);
            let response = transport
                .send(&host, &request)
                .await
                .map_err(|e| anyhow::anyhow!("screenshot request failed: {}", e))?;

            let parsed: Value = serde_json::from_str(&response.content)?;
            let encoded = parsed
                .get("value")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("screenshot response has no value"))?;
            let png = BASE64.decode(encoded)?;

            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, png).await?;
            Ok(())
        });
    }
}

fn selenium_target(endpoint: &Endpoint) -> Result<(String, u16), CreationError> {
    let addr = endpoint
        .addr()
        .ok_or_else(|| CreationError::SessionStartFailed {
            endpoint: endpoint.name.clone(),
            reason: "endpoint has no address".into(),
        })?;
    Ok((addr.ip, addr.selenium_port))
}

/// A POST on a session subpath is a user action worth capturing, except
/// the screenshot command itself.
fn wants_screenshot(session: &Session, request: &WireRequest) -> bool {
    session.take_screenshot
        && request.method.eq_ignore_ascii_case("POST")
        && !request.url.ends_with("/screenshot")
}

fn substitute_request(mut request: WireRequest, from: &str, to: &str) -> WireRequest {
    request.url = request.url.replace(from, to);
    if !request.data.is_empty() {
        request.data = request.data.replace(from, to);
    }
    request
}

fn substitute_response(mut response: WireResponse, from: &str, to: &str) -> WireResponse {
    if !response.content.is_empty() {
        response.content = response.content.replace(from, to);
    }
    response
}

/// Selenium may answer in JSONWire shape (`sessionId` top level) or W3C
/// shape (`value.sessionId`).
fn extract_selenium_session_id(content: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(content).ok()?;
    parsed
        .get("sessionId")
        .or_else(|| parsed.get("value").and_then(|v| v.get("sessionId")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactSettings;
    use crate::endpoint::testing::FakeBackend;
    use crate::pool::testing::listening_addr;
    use crate::transport::{TransportError, TransportResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Scripted transport: pops one canned result per send and records
    /// every request it saw.
    struct FakeTransport {
        responses: Mutex<VecDeque<TransportResult<WireResponse>>>,
        seen: Mutex<Vec<(String, WireRequest)>>,
    }

    impl FakeTransport {
        fn new(responses: Vec<TransportResult<WireResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(String, WireRequest)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, host: &str, request: &WireRequest) -> TransportResult<WireResponse> {
            self.seen
                .lock()
                .unwrap()
                .push((host.to_string(), request.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(WireResponse::ok("{}")))
        }
    }

    fn collector(dir: &std::path::Path) -> Arc<ArtifactCollector> {
        ArtifactCollector::start(ArtifactSettings {
            dir: dir.to_path_buf(),
            wait_timeout: Duration::from_secs(2),
            ..ArtifactSettings::default()
        })
    }

    fn proxy_with(transport: Arc<FakeTransport>, dir: &std::path::Path) -> SessionRequestProxy {
        SessionRequestProxy::new(
            transport,
            collector(dir),
            ProxySettings {
                ping_timeout: Duration::from_millis(300),
                make_request_attempts: 3,
            },
        )
    }

    async fn ready_endpoint() -> (Arc<Endpoint>, Vec<tokio::task::JoinHandle<()>>) {
        let (addr, guards) = listening_addr().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let endpoint = Arc::new(Endpoint::new(
            "ubuntu-14.04-x64",
            "ondemand",
            Box::new(Arc::new(FakeBackend::with_addr(addr))),
            Duration::from_millis(300),
            tx,
        ));
        endpoint.create().await.unwrap();
        (endpoint, guards)
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(
            "ubuntu-14.04-x64",
            json!({ "browserName": "chrome" }),
        ))
    }

    #[test]
    fn webdriver_error_shape() {
        let body = webdriver_error(STATUS_UNKNOWN_ERROR, "boom");
        assert_eq!(body["status"], 13);
        assert_eq!(body["value"]["message"], "boom");
    }

    #[test]
    fn session_id_extraction_from_path() {
        assert_eq!(
            session_id_from_path("/wd/hub/session/abc-123/url"),
            Some("abc-123")
        );
        assert_eq!(session_id_from_path("/wd/hub/session"), None);
        assert_eq!(session_id_from_path("/wd/hub/status"), None);
    }

    #[tokio::test]
    async fn make_request_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![
            Err(TransportError::Connection("refused".into())),
            Err(TransportError::Connection("refused".into())),
            Ok(WireResponse::ok("fine")),
        ]);
        let proxy = proxy_with(transport.clone(), dir.path());

        let session = session();
        let request = WireRequest::new("GET", "/wd/hub/status", 4455);
        let response = proxy
            .make_request(&session, "127.0.0.1", &request)
            .await
            .unwrap();
        assert_eq!(response.content, "fine");
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn make_request_gives_up_after_budget() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![
            Err(TransportError::Connection("refused".into())),
            Err(TransportError::Connection("refused".into())),
            Err(TransportError::Connection("refused".into())),
        ]);
        let proxy = proxy_with(transport.clone(), dir.path());

        let session = session();
        let request = WireRequest::new("GET", "/wd/hub/status", 4455);
        let err = proxy
            .make_request(&session, "127.0.0.1", &request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CreationError::RequestFailed { attempts: 3, .. }
        ));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn client_disconnect_closes_session_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![
            Err(TransportError::ClientDisconnected("tab closed".into())),
            Ok(WireResponse::ok("never reached")),
        ]);
        let proxy = proxy_with(transport.clone(), dir.path());

        let session = session();
        let request = WireRequest::new("GET", "/wd/hub/status", 4455);
        let err = proxy
            .make_request(&session, "127.0.0.1", &request)
            .await
            .unwrap_err();

        assert!(matches!(err, CreationError::SessionClosed(_)));
        // One attempt only; the retry budget does not apply.
        assert_eq!(transport.requests().len(), 1);
        assert!(session.is_closed());
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.reason().unwrap().contains("tab closed"));
    }

    #[tokio::test]
    async fn closed_session_aborts_without_sending() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![]);
        let proxy = proxy_with(transport.clone(), dir.path());

        let session = session();
        session.failed("client gone");

        let request = WireRequest::new("GET", "/wd/hub/status", 4455);
        let err = proxy
            .make_request(&session, "127.0.0.1", &request)
            .await
            .unwrap_err();
        assert!(matches!(err, CreationError::SessionClosed(_)));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn start_session_walks_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![
            // selenium_status
            Ok(WireResponse::ok(r#"{"status":0}"#)),
            // start_selenium_session
            Ok(WireResponse::ok(
                r#"{"sessionId":"native-42","status":0,"value":{}}"#,
            )),
        ]);
        let proxy = proxy_with(transport.clone(), dir.path());
        let (endpoint, _guards) = ready_endpoint().await;
        let session = session();

        let response = proxy
            .start_session(&session, &endpoint, None)
            .await
            .unwrap();

        assert_eq!(session.selenium_session().as_deref(), Some("native-42"));
        assert_eq!(session.status(), SessionStatus::Running);
        // The native id never leaks outward.
        assert!(!response.content.contains("native-42"));
        assert!(response.content.contains(&session.id.to_string()));

        let seen = transport.requests();
        assert_eq!(seen[0].1.url, "/wd/hub/status");
        assert_eq!(seen[1].1.url, "/wd/hub/session");
    }

    #[tokio::test]
    async fn startup_script_runs_between_status_and_session_start() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![
            Ok(WireResponse::ok(r#"{"status":0}"#)),
            Ok(WireResponse::ok(r#"{"output":""}"#)),
            Ok(WireResponse::ok(r#"{"sessionId":"native-1","value":{}}"#)),
        ]);
        let proxy = proxy_with(transport.clone(), dir.path());
        let (endpoint, _guards) = ready_endpoint().await;
        let session = session();

        proxy
            .start_session(&session, &endpoint, Some("service selenium restart"))
            .await
            .unwrap();

        let seen = transport.requests();
        assert_eq!(seen[1].1.url, "/runScript");
        assert_eq!(seen[1].1.method, "POST");
        let body: Value = serde_json::from_str(&seen[1].1.data).unwrap();
        assert_eq!(body["script"], "service selenium restart");
        // Agent port, not the selenium port.
        assert_eq!(seen[1].1.port, endpoint.addr().unwrap().agent_port);
    }

    #[tokio::test]
    async fn start_session_fails_when_closed_mid_stage() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(vec![]);
        let proxy = proxy_with(transport.clone(), dir.path());
        let (endpoint, _guards) = ready_endpoint().await;
        let session = session();
        session.failed("timed out");

        let err = proxy
            .start_session(&session, &endpoint, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CreationError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn proxy_request_swaps_session_ids_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _guards) = ready_endpoint().await;
        let session = session();
        session.set_selenium_session("native-7");

        let transport = FakeTransport::new(vec![Ok(WireResponse::ok(
            r#"{"sessionId":"native-7","value":null}"#,
        ))]);
        let proxy = proxy_with(transport.clone(), dir.path());

        let external = session.id.to_string();
        let request = WireRequest::new("POST", format!("/wd/hub/session/{}/url", external), 4455)
            .body(format!(r#"{{"session":"{}"}}"#, external));
        let response = proxy
            .proxy_request(&session, &endpoint, request)
            .await
            .unwrap();

        let seen = transport.requests();
        assert_eq!(seen[0].1.url, "/wd/hub/session/native-7/url");
        assert_eq!(seen[0].1.data, r#"{"session":"native-7"}"#);
        assert!(response.content.contains(&external));
        assert!(!response.content.contains("native-7"));
    }

    #[tokio::test]
    async fn screenshot_saved_for_qualifying_post() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, _guards) = ready_endpoint().await;

        let session = Arc::new(Session::new(
            "ubuntu-14.04-x64",
            json!({ "browserName": "chrome", "takeScreenshot": true }),
        ));
        session.set_selenium_session("native-9");

        let png = BASE64.encode(b"not-really-png");
        let transport = FakeTransport::new(vec![
            Ok(WireResponse::ok(r#"{"value":null}"#)),
            Ok(WireResponse::ok(format!(r#"{{"value":"{}"}}"#, png))),
        ]);
        let collector = collector(dir.path());
        let proxy = SessionRequestProxy::new(transport.clone(), collector.clone(), ProxySettings {
            ping_timeout: Duration::from_millis(300),
            make_request_attempts: 1,
        });

        let request = WireRequest::new(
            "POST",
            format!("/wd/hub/session/{}/url", session.id),
            4455,
        );
        proxy
            .proxy_request(&session, &endpoint, request)
            .await
            .unwrap();

        collector.wait_for_complete(session.id).await;

        let saved: Vec<_> = std::fs::read_dir(collector.session_dir(session.id))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(std::fs::read(&saved[0]).unwrap(), b"not-really-png");
    }
}
