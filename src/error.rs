//! Error taxonomy shared across the crate.
//!
//! Retryable operations (ping, status checks, request forwarding) retry
//! locally up to their budget and then escalate to [`CreationError`];
//! capacity and matching failures surface immediately without retrying.

use uuid::Uuid;

/// Requested platform/browser has no matching backend.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("no such platform: {0}")]
    NoSuchPlatform(String),

    #[error("no platform matched capabilities: {0}")]
    NoMatch(String),
}

/// Referenced session is not among the active sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("there is no active session {0} (not found)")]
    NotFound(Uuid),

    #[error("session {0} is closed")]
    Closed(Uuid),
}

/// Endpoint or session failed to reach a usable state within its
/// retry/timeout budget. Always results in endpoint teardown and a
/// failed session.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("provider {provider} is at its session limit ({limit})")]
    ProviderSaturated { provider: String, limit: u32 },

    #[error("couldn't get an endpoint for platform {platform} within {timeout_secs}s")]
    GetVmTimeout { platform: String, timeout_secs: u64 },

    #[error("endpoint {endpoint} did not answer on required ports within {timeout_secs}s")]
    PingTimeout { endpoint: String, timeout_secs: u64 },

    #[error("selenium status check failed on {endpoint} after {attempts} attempt(s): {reason}")]
    StatusFailed {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("couldn't start selenium session on {endpoint}: {reason}")]
    SessionStartFailed { endpoint: String, reason: String },

    #[error("startup script failed on {endpoint}: {reason}")]
    ScriptFailed { endpoint: String, reason: String },

    #[error("request to {host} failed after {attempts} attempt(s): {reason}")]
    RequestFailed {
        host: String,
        attempts: u32,
        reason: String,
    },

    #[error("session {0} was closed during creation")]
    SessionClosed(Uuid),
}
