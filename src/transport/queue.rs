//! Queue transport for endpoints living in a remote provider process.
//!
//! Requests are published as frames tagged with a `correlation_id` and a
//! `reply_to` queue name; the remote consumer executes them against the
//! endpoint and answers on the reply queue. The correlation registry
//! matches each response to its originating request exactly once and
//! garbage-collects entries on delivery or timeout.
//!
//! Service-control messages (`CLIENT_DISCONNECTED`, `SESSION_CLOSING`)
//! drive channel mute/unmute and platform-slot accounting on the consumer
//! side, and are acknowledged exactly once whether or not the referenced
//! channel is still open.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Transport, TransportError, TransportResult, WireRequest, WireResponse};

/// A published request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueFrame {
    pub correlation_id: Uuid,
    pub reply_to: String,
    /// Target endpoint host; ports travel inside the payload.
    pub host: String,
    pub payload: WireRequest,
}

/// Service-control command names, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceCommand {
    #[serde(rename = "CLIENT_DISCONNECTED")]
    ClientDisconnected,
    #[serde(rename = "SESSION_CLOSING")]
    SessionClosing,
}

/// A service-control message published alongside request frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMessage {
    /// Message id used for exactly-once acknowledgement.
    pub id: Uuid,
    pub command: ServiceCommand,
    pub platform: String,
    pub session: Uuid,
}

/// What a channel is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRole {
    Session(Uuid),
    Platform(String),
    Service,
}

#[derive(Debug)]
struct ChannelState {
    role: ChannelRole,
    muted: bool,
}

/// Typed registry of consumer channels with explicit mute transitions.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, ChannelState>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, role: ChannelRole) {
        self.channels
            .lock()
            .unwrap()
            .insert(id.into(), ChannelState { role, muted: false });
    }

    /// Mute a channel. Returns false when the channel is unknown.
    pub fn mute(&self, id: &str) -> bool {
        match self.channels.lock().unwrap().get_mut(id) {
            Some(state) => {
                state.muted = true;
                true
            }
            None => false,
        }
    }

    /// Unmute a channel. Returns false when the channel is unknown.
    pub fn unmute(&self, id: &str) -> bool {
        match self.channels.lock().unwrap().get_mut(id) {
            Some(state) => {
                state.muted = false;
                true
            }
            None => false,
        }
    }

    pub fn is_muted(&self, id: &str) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(id)
            .map(|s| s.muted)
            .unwrap_or(false)
    }

    pub fn close(&self, id: &str) -> bool {
        self.channels.lock().unwrap().remove(id).is_some()
    }

    /// Channel id bound to a session, if one is registered.
    pub fn find_session_channel(&self, session: Uuid) -> Option<String> {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .find(|(_, state)| state.role == ChannelRole::Session(session))
            .map(|(id, _)| id.clone())
    }

    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().unwrap().is_empty()
    }
}

/// Pending-request table: correlation id → response slot.
///
/// Each entry is consumed exactly once by the first matching response or
/// abort; late or duplicate deliveries are dropped with a warning.
#[derive(Default)]
struct CorrelationRegistry {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<TransportResult<WireResponse>>>>,
}

impl CorrelationRegistry {
    fn register(&self, id: Uuid) -> oneshot::Receiver<TransportResult<WireResponse>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        rx
    }

    fn resolve(&self, id: Uuid, result: TransportResult<WireResponse>) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                warn!("response for unknown or already-fulfilled correlation {}", id);
                false
            }
        }
    }

    fn forget(&self, id: Uuid) {
        self.pending.lock().unwrap().remove(&id);
    }

    fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Transport that publishes requests to a remote provider over a message
/// queue and correlates the responses back.
pub struct QueueTransport {
    outbound: mpsc::UnboundedSender<QueueFrame>,
    reply_to: String,
    correlations: CorrelationRegistry,
    channels: ChannelRegistry,
    response_timeout: Duration,
    /// platform → occupied slots on the consumer side.
    slots: Mutex<HashMap<String, u32>>,
    acked: Mutex<HashSet<Uuid>>,
}

impl QueueTransport {
    pub fn new(
        outbound: mpsc::UnboundedSender<QueueFrame>,
        reply_to: impl Into<String>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            outbound,
            reply_to: reply_to.into(),
            correlations: CorrelationRegistry::default(),
            channels: ChannelRegistry::new(),
            response_timeout,
            slots: Mutex::new(HashMap::new()),
            acked: Mutex::new(HashSet::new()),
        }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Deliver a response for a published frame. Returns true when a
    /// pending request consumed it.
    pub fn deliver(&self, correlation_id: Uuid, response: WireResponse) -> bool {
        self.correlations.resolve(correlation_id, Ok(response))
    }

    /// Resolve a pending frame with a client-disconnect notice instead of
    /// a response. The consumer sends this when the requesting client went
    /// away mid-flight; the waiting caller gets a non-retryable error.
    pub fn abort(&self, correlation_id: Uuid, reason: impl Into<String>) -> bool {
        self.correlations
            .resolve(correlation_id, Err(TransportError::ClientDisconnected(reason.into())))
    }

    pub fn pending_requests(&self) -> usize {
        self.correlations.pending_count()
    }

    /// Occupy a platform slot when a remote session channel opens.
    pub fn occupy_slot(&self, platform: &str) {
        *self.slots.lock().unwrap().entry(platform.to_string()).or_insert(0) += 1;
    }

    pub fn occupied_slots(&self, platform: &str) -> u32 {
        self.slots.lock().unwrap().get(platform).copied().unwrap_or(0)
    }

    /// Handle a service-control message.
    ///
    /// Returns true exactly once per message id; redeliveries return false
    /// so the caller never double-acks. The channel work itself is
    /// best-effort: a command referencing an already-closed channel still
    /// gets its acknowledgement.
    pub fn handle_service_message(&self, message: &ServiceMessage) -> bool {
        if !self.acked.lock().unwrap().insert(message.id) {
            debug!("service message {} already acknowledged", message.id);
            return false;
        }

        match message.command {
            ServiceCommand::ClientDisconnected => {
                if let Some(channel) = self.channels.find_session_channel(message.session)
                {
                    self.channels.mute(&channel);
                }
            }
            ServiceCommand::SessionClosing => {
                if let Some(channel) = self.channels.find_session_channel(message.session)
                {
                    self.channels.close(&channel);
                }
                let mut slots = self.slots.lock().unwrap();
                if let Some(count) = slots.get_mut(&message.platform) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        true
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn send(&self, host: &str, request: &WireRequest) -> TransportResult<WireResponse> {
        let correlation_id = Uuid::new_v4();
        let rx = self.correlations.register(correlation_id);

        let frame = QueueFrame {
            correlation_id,
            reply_to: self.reply_to.clone(),
            host: host.to_string(),
            payload: request.clone(),
        };

        if self.outbound.send(frame).is_err() {
            self.correlations.forget(correlation_id);
            return Err(TransportError::NoConsumer(
                "queue consumer is gone".to_string(),
            ));
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.correlations.forget(correlation_id);
                Err(TransportError::Connection(
                    "correlation entry dropped before response".to_string(),
                ))
            }
            Err(_) => {
                // GC the entry so a late response is dropped, not leaked.
                self.correlations.forget(correlation_id);
                Err(TransportError::Timeout(format!(
                    "no response within {:?} (correlation {})",
                    self.response_timeout, correlation_id
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> (QueueTransport, mpsc::UnboundedReceiver<QueueFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            QueueTransport::new(tx, "gridpool-reply", Duration::from_millis(500)),
            rx,
        )
    }

    #[tokio::test]
    async fn correlates_response_to_request() {
        let (transport, mut rx) = transport();
        let transport = std::sync::Arc::new(transport);

        let responder = transport.clone();
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.reply_to, "gridpool-reply");
            responder.deliver(frame.correlation_id, WireResponse::ok("pong"));
        });

        let req = WireRequest::new("GET", "/wd/hub/status", 4455);
        let resp = transport.send("10.0.0.9", &req).await.unwrap();
        assert_eq!(resp.content, "pong");
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn times_out_and_collects_entry() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = QueueTransport::new(tx, "r", Duration::from_millis(20));

        let req = WireRequest::new("GET", "/wd/hub/status", 4455);
        let err = transport.send("10.0.0.9", &req).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(transport.pending_requests(), 0);
    }

    #[tokio::test]
    async fn duplicate_response_is_dropped() {
        let (transport, mut rx) = transport();
        let transport = std::sync::Arc::new(transport);

        let responder = transport.clone();
        let delivered = tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            let first = responder.deliver(frame.correlation_id, WireResponse::ok("a"));
            let second = responder.deliver(frame.correlation_id, WireResponse::ok("b"));
            (first, second)
        });

        let req = WireRequest::new("GET", "/wd/hub/status", 4455);
        let resp = transport.send("10.0.0.9", &req).await.unwrap();
        assert_eq!(resp.content, "a");

        let (first, second) = delivered.await.unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn aborted_request_reports_client_disconnect() {
        let (transport, mut rx) = transport();
        let transport = std::sync::Arc::new(transport);

        let aborter = transport.clone();
        tokio::spawn(async move {
            let frame = rx.recv().await.unwrap();
            assert!(aborter.abort(frame.correlation_id, "browser tab closed"));
        });

        let req = WireRequest::new("GET", "/wd/hub/status", 4455);
        let err = transport.send("10.0.0.9", &req).await.unwrap_err();
        assert!(matches!(err, TransportError::ClientDisconnected(_)));
        assert_eq!(transport.pending_requests(), 0);
    }

    #[test]
    fn frames_serialize_with_ids() {
        let frame = QueueFrame {
            correlation_id: Uuid::nil(),
            reply_to: "gridpool-reply".to_string(),
            host: "10.0.0.9".to_string(),
            payload: WireRequest::new("GET", "/wd/hub/status", 4455),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json["correlation_id"],
            "00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(json["payload"]["port"], 4455);

        let message = ServiceMessage {
            id: Uuid::new_v4(),
            command: ServiceCommand::ClientDisconnected,
            platform: "ubuntu-14.04-x64".to_string(),
            session: Uuid::new_v4(),
        };
        let back: ServiceMessage =
            serde_json::from_str(&serde_json::to_string(&message).unwrap()).unwrap();
        assert_eq!(back.id, message.id);
        assert_eq!(back.session, message.session);
    }

    #[test]
    fn channel_mute_unmute() {
        let registry = ChannelRegistry::new();
        let session = Uuid::new_v4();
        registry.register("ch-1", ChannelRole::Session(session));

        assert!(!registry.is_muted("ch-1"));
        assert!(registry.mute("ch-1"));
        assert!(registry.is_muted("ch-1"));
        assert!(registry.unmute("ch-1"));
        assert!(!registry.is_muted("ch-1"));

        // Unknown channels never panic, they just report failure.
        assert!(!registry.mute("nope"));
        assert_eq!(registry.find_session_channel(session).as_deref(), Some("ch-1"));
    }

    #[test]
    fn service_message_acked_exactly_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = QueueTransport::new(tx, "r", Duration::from_secs(1));

        let session = Uuid::new_v4();
        transport.channels().register("ch-1", ChannelRole::Session(session));
        transport.occupy_slot("ubuntu-14.04-x64");

        let message = ServiceMessage {
            id: Uuid::new_v4(),
            command: ServiceCommand::SessionClosing,
            platform: "ubuntu-14.04-x64".to_string(),
            session,
        };

        assert!(transport.handle_service_message(&message));
        assert_eq!(transport.occupied_slots("ubuntu-14.04-x64"), 0);
        assert!(transport.channels().find_session_channel(session).is_none());

        // Redelivery: no second ack, slot accounting untouched.
        assert!(!transport.handle_service_message(&message));
        assert_eq!(transport.occupied_slots("ubuntu-14.04-x64"), 0);
    }

    #[test]
    fn command_on_closed_channel_still_acks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = QueueTransport::new(tx, "r", Duration::from_secs(1));

        let message = ServiceMessage {
            id: Uuid::new_v4(),
            command: ServiceCommand::ClientDisconnected,
            platform: "ubuntu-14.04-x64".to_string(),
            session: Uuid::new_v4(),
        };
        assert!(transport.handle_service_message(&message));
    }

    #[test]
    fn service_command_wire_names() {
        let json = serde_json::to_string(&ServiceCommand::ClientDisconnected).unwrap();
        assert_eq!(json, "\"CLIENT_DISCONNECTED\"");
        let cmd: ServiceCommand = serde_json::from_str("\"SESSION_CLOSING\"").unwrap();
        assert_eq!(cmd, ServiceCommand::SessionClosing);
    }
}
