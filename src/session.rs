//! Session state and the registry of active sessions.
//!
//! A [`Session`] binds one test run to exactly one endpoint for its
//! lifetime. Status moves monotonically along
//! waiting → preparing → running → {succeed, failed}; `closed` is a
//! one-way latch, so closing an already-closed session is a no-op that
//! never overwrites the original outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::SessionError;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Waiting,
    Preparing,
    Running,
    Succeed,
    Failed,
}

impl SessionStatus {
    /// Rank along the monotonic transition order.
    fn rank(self) -> u8 {
        match self {
            SessionStatus::Waiting => 0,
            SessionStatus::Preparing => 1,
            SessionStatus::Running => 2,
            SessionStatus::Succeed | SessionStatus::Failed => 3,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Preparing => "preparing",
            SessionStatus::Running => "running",
            SessionStatus::Succeed => "succeed",
            SessionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct SessionInner {
    status: SessionStatus,
    closed: bool,
    timeouted: bool,
    reason: Option<String>,
    /// Backend-native selenium session id, set once after a successful
    /// remote-session start.
    selenium_session: Option<String>,
    modified: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
}

/// One test run bound to one endpoint.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub platform: String,
    /// Raw desiredCapabilities document from the creation request.
    pub desired_capabilities: Value,
    pub created: DateTime<Utc>,
    pub take_screenshot: bool,
    pub take_screencast: bool,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(platform: impl Into<String>, desired_capabilities: Value) -> Self {
        let take_screenshot = desired_capabilities
            .get("takeScreenshot")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let take_screencast = desired_capabilities
            .get("takeScreencast")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            id: Uuid::new_v4(),
            platform: platform.into(),
            desired_capabilities,
            created: Utc::now(),
            take_screenshot,
            take_screencast,
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Waiting,
                closed: false,
                timeouted: false,
                reason: None,
                selenium_session: None,
                modified: Utc::now(),
                deleted: None,
            }),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().unwrap().status
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn is_timeouted(&self) -> bool {
        self.inner.lock().unwrap().timeouted
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.lock().unwrap().reason.clone()
    }

    pub fn selenium_session(&self) -> Option<String> {
        self.inner.lock().unwrap().selenium_session.clone()
    }

    /// Record the backend-native selenium session id. Set once; later
    /// calls are ignored.
    pub fn set_selenium_session(&self, native_id: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.selenium_session.is_none() {
            inner.selenium_session = Some(native_id.into());
        }
    }

    /// Refresh the last-activity timestamp.
    pub fn touch(&self) {
        self.inner.lock().unwrap().modified = Utc::now();
    }

    /// Seconds since the last activity.
    pub fn inactivity_secs(&self) -> i64 {
        let modified = self.inner.lock().unwrap().modified;
        (Utc::now() - modified).num_seconds()
    }

    /// Whether the session exceeded the inactivity timeout. Latches the
    /// `timeouted` flag on first detection.
    pub fn check_timeout(&self, session_timeout_secs: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return inner.timeouted;
        }
        if (Utc::now() - inner.modified).num_seconds() >= session_timeout_secs as i64 {
            inner.timeouted = true;
        }
        inner.timeouted
    }

    /// Advance the status; regressions are ignored (monotonic order).
    pub fn set_status(&self, status: SessionStatus) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        if status.rank() >= inner.status.rank() {
            inner.status = status;
            inner.modified = Utc::now();
        }
    }

    /// Mark the session running (remote selenium session started).
    pub fn run(&self) {
        self.set_status(SessionStatus::Running);
    }

    /// Close the session as succeeded. No-op if already closed.
    pub fn succeed(&self) {
        self.close_with(SessionStatus::Succeed, None);
    }

    /// Close the session as failed with a reason. No-op if already closed;
    /// the original reason is never overwritten.
    pub fn failed(&self, reason: impl Into<String>) {
        self.close_with(SessionStatus::Failed, Some(reason.into()));
    }

    fn close_with(&self, status: SessionStatus, reason: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            debug!("session {} already closed, ignoring {:?}", self.id, status);
            return;
        }
        inner.closed = true;
        inner.status = status;
        inner.reason = reason;
        inner.modified = Utc::now();
        inner.deleted = Some(Utc::now());
    }
}

/// Registry of active sessions, shared between the front controller, the
/// proxy and the pool workers.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.sessions.lock().unwrap().insert(session.id, session);
    }

    /// Look up an active session by its external id.
    pub fn get(&self, id: Uuid) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().remove(&id)
    }

    /// Snapshot of all active sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Sessions whose inactivity exceeds the timeout.
    pub fn timeouted(&self, session_timeout_secs: u64) -> Vec<Arc<Session>> {
        self.all()
            .into_iter()
            .filter(|s| !s.is_closed() && s.check_timeout(session_timeout_secs))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn close_is_idempotent() {
        let session = Session::new("ubuntu-14.04-x64", json!({}));
        session.failed("endpoint went away");
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.reason().as_deref(), Some("endpoint went away"));

        // A later failure must not overwrite the original reason, and a
        // later success must not flip the status.
        session.failed("second failure");
        session.succeed();
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.reason().as_deref(), Some("endpoint went away"));
    }

    #[test]
    fn status_is_monotonic() {
        let session = Session::new("ubuntu-14.04-x64", json!({}));
        session.set_status(SessionStatus::Running);
        session.set_status(SessionStatus::Waiting);
        assert_eq!(session.status(), SessionStatus::Running);
    }

    #[test]
    fn selenium_session_set_once() {
        let session = Session::new("ubuntu-14.04-x64", json!({}));
        session.set_selenium_session("native-1");
        session.set_selenium_session("native-2");
        assert_eq!(session.selenium_session().as_deref(), Some("native-1"));
    }

    #[test]
    fn screenshot_flags_from_capabilities() {
        let session = Session::new(
            "ubuntu-14.04-x64",
            json!({"takeScreenshot": true, "takeScreencast": false}),
        );
        assert!(session.take_screenshot);
        assert!(!session.take_screencast);
    }

    #[test]
    fn registry_lookup() {
        let registry = SessionRegistry::new();
        let session = Arc::new(Session::new("ubuntu-14.04-x64", json!({})));
        let id = session.id;
        registry.insert(session);

        assert!(registry.get(id).is_ok());
        assert!(registry.get(Uuid::new_v4()).is_err());

        registry.remove(id);
        assert!(registry.get(id).is_err());
    }
}
