// ── Cziczere Atoms: Error Types ────────────────────────────────────────────
// Single canonical error enum for the sync engine, built with `thiserror`.
//
// Design rules:
//   • Variants follow the failure taxonomy of the engine: connection,
//     correlation, push feed, reconciliation, one-shot calls.
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Transient socket failures are retried inside the connection manager and
//     never leave it; terminal ones are surfaced once through the snapshot.
//   • No variant carries secret material (bearer tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SyncError {
    /// A send was attempted while the channel is not `Connected`.
    /// Callers retry later; nothing is queued on their behalf.
    #[error("Not connected")]
    NotConnected,

    /// A correlated message passed its deadline without a response.
    #[error("Timed out waiting for response to {correlation_id}")]
    Timeout { correlation_id: String },

    /// The session was torn down while the operation was in flight.
    #[error("Cancelled")]
    Cancelled,

    /// A push-feed subscription failed. Not retried automatically.
    #[error("Subscription error: {collection}: {message}")]
    Subscription { collection: String, message: String },

    /// The connection manager gave up after the configured attempt count.
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// An optimistic entry saw no authoritative counterpart within its grace period.
    #[error("No authoritative record arrived for optimistic entry {fingerprint}")]
    ReconciliationMismatch { fingerprint: String },

    /// WebSocket open/read/write failure or close frame.
    #[error("Socket error: {0}")]
    Socket(String),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// One-shot backend call returned a non-success status.
    #[error("API error: {endpoint}: {status}: {message}")]
    Api { endpoint: String, status: u16, message: String },

    /// The owned rate limiter refused the call before it left the process.
    #[error("Rate limited: {endpoint}")]
    RateLimited { endpoint: String },

    /// The backend circuit is open after a run of failed calls.
    #[error("Backend unavailable after {failures} consecutive failures, retry in {retry_in_secs}s")]
    BackendUnavailable { failures: u32, retry_in_secs: u64 },

    /// Missing or rejected credential.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl SyncError {
    /// Create a subscription error for a collection.
    pub fn subscription(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscription { collection: collection.into(), message: message.into() }
    }

    /// Create an API error for an endpoint.
    pub fn api(endpoint: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Api { endpoint: endpoint.into(), status, message: message.into() }
    }

    /// Create a socket error from anything displayable.
    pub fn socket(message: impl std::fmt::Display) -> Self {
        Self::Socket(message.to_string())
    }
}

// ── Bridge: String → SyncError ─────────────────────────────────────────────

impl From<String> for SyncError {
    fn from(s: String) -> Self {
        SyncError::Other(s)
    }
}

impl From<&str> for SyncError {
    fn from(s: &str) -> Self {
        SyncError::Other(s.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Socket(e.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(e: url::ParseError) -> Self {
        SyncError::Config(format!("Invalid URL: {}", e))
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type SyncResult<T> = Result<T, SyncError>;

// ── Conversion: SyncError → String ─────────────────────────────────────────
// Lets the store's `error` field and host boundaries take `.into()` directly.

impl From<SyncError> for String {
    fn from(e: SyncError) -> Self {
        e.to_string()
    }
}
