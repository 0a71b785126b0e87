// Cziczere Sync Engine: Store Actions
//
// The closed set of state transitions. Every component talks to the store
// by dispatching one of these; nothing mutates a snapshot directly.
//
// JSON form: {"type": "reconcile", "payload": {...}}. Unknown types decode
// to `Action::Unknown`, which the reducer treats as a no-op.

use crate::atoms::types::{
    AtmosphereData, ChatMessage, ConnectionState, Fingerprint, InsightRecord, MemoryRecord, UserId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Action {
    // ── Memories ───────────────────────────────────────────────────────
    LoadStart,
    LoadSuccess(Vec<MemoryRecord>),
    LoadError(String),
    /// Speculative record; `client_ref` carries the fingerprint nonce.
    AddOptimistic(MemoryRecord),
    /// Authoritative record replacing its optimistic draft, or upserted by id.
    Reconcile {
        #[serde(default)]
        fingerprint: Option<Fingerprint>,
        record: MemoryRecord,
    },
    Update(MemoryRecord),
    Delete(String),
    OptimisticFailed(Fingerprint),

    // ── Insights ───────────────────────────────────────────────────────
    InsightsLoadStart,
    InsightsLoaded(Vec<InsightRecord>),
    InsightAdded(InsightRecord),
    InsightRemoved(String),

    // ── Atmosphere ─────────────────────────────────────────────────────
    AtmosphereUpdated { data: AtmosphereData, at_ms: i64 },

    // ── Session ────────────────────────────────────────────────────────
    ConnectionChanged(ConnectionState),
    IdentityChanged(Option<UserId>),

    // ── Chat channel ───────────────────────────────────────────────────
    ChatMessageReceived(ChatMessage),
    TypingChanged(bool),
    SuggestionsReceived(Vec<String>),
    SystemNotice(String),

    // ── Errors ─────────────────────────────────────────────────────────
    SetError(String),
    ClearError,

    #[serde(other)]
    Unknown,
}

impl Action {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Action::LoadStart => "load-start",
            Action::LoadSuccess(_) => "load-success",
            Action::LoadError(_) => "load-error",
            Action::AddOptimistic(_) => "add-optimistic",
            Action::Reconcile { .. } => "reconcile",
            Action::Update(_) => "update",
            Action::Delete(_) => "delete",
            Action::OptimisticFailed(_) => "optimistic-failed",
            Action::InsightsLoadStart => "insights-load-start",
            Action::InsightsLoaded(_) => "insights-loaded",
            Action::InsightAdded(_) => "insight-added",
            Action::InsightRemoved(_) => "insight-removed",
            Action::AtmosphereUpdated { .. } => "atmosphere-updated",
            Action::ConnectionChanged(_) => "connection-changed",
            Action::IdentityChanged(_) => "identity-changed",
            Action::ChatMessageReceived(_) => "chat-message-received",
            Action::TypingChanged(_) => "typing-changed",
            Action::SuggestionsReceived(_) => "suggestions-received",
            Action::SystemNotice(_) => "system-notice",
            Action::SetError(_) => "set-error",
            Action::ClearError => "clear-error",
            Action::Unknown => "unknown",
        }
    }
}
