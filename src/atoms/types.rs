// ── Cziczere Atoms: Pure Data Types ───────────────────────────────────────────
// Plain struct/enum definitions shared by every engine component.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.
//
// Wire and feed shapes use camelCase field names; the backend owns them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Identity & credentials ─────────────────────────────────────────────────

/// Opaque user identifier supplied by the credential source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// Opaque bearer credential. Debug output is redacted so tokens never reach logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    pub fn new(raw: impl Into<String>) -> Self {
        Token(raw.into())
    }

    /// The raw credential, for headers and handshake parameters only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(***)")
    }
}

// ── Memories ───────────────────────────────────────────────────────────────

/// Where a memory stands relative to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Authoritative record from the backend.
    #[default]
    Confirmed,
    /// Speculative local write awaiting its authoritative counterpart.
    Pending,
    /// Speculative write whose grace period ran out. Kept visible.
    Failed,
}

/// Client-generated identity of an optimistic write.
///
/// `(owner_id, timestamp)` is what the backend echoes back; `nonce` keeps two
/// writes issued in the same millisecond apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub owner_id: UserId,
    pub timestamp: i64,
    pub nonce: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.owner_id, self.timestamp, self.nonce)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Backend-assigned id. Never present on optimistic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "userId")]
    pub owner_id: UserId,
    #[serde(rename = "userText")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prompt: Option<String>,
    /// Derived image reference produced by the enrichment backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Creation instant, epoch milliseconds.
    pub timestamp: i64,
    /// Emotion name → intensity in [0, 1].
    #[serde(default)]
    pub emotions: BTreeMap<String, f64>,
    #[serde(default = "default_memory_kind")]
    pub kind: String,
    /// Echo of the client nonce sent with the create call, when the backend provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
    #[serde(default)]
    pub status: SyncStatus,
}

fn default_memory_kind() -> String {
    "plant".into()
}

impl MemoryRecord {
    /// A fresh speculative record for `owner`. Id is absent by construction.
    pub fn draft(owner: UserId, text: impl Into<String>, timestamp: i64) -> Self {
        MemoryRecord {
            id: None,
            owner_id: owner,
            text: text.into(),
            image_prompt: None,
            image_url: None,
            timestamp,
            emotions: BTreeMap::new(),
            kind: default_memory_kind(),
            client_ref: None,
            status: SyncStatus::Pending,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_none()
    }
}

// ── Insights ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightRecord {
    pub id: String,
    #[serde(rename = "userId")]
    pub owner_id: UserId,
    pub text: String,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collage_url: Option<String>,
}

// ── Atmosphere ─────────────────────────────────────────────────────────────

/// Garden ambience derived from recent memories by the atmosphere call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtmosphereData {
    #[serde(default)]
    pub mood: String,
    #[serde(default)]
    pub palette: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub music_url: Option<String>,
}

// ── Chat ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatSender {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    #[default]
    Text,
    Insight,
    Suggestion,
    MemoryAnalysis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: ChatSender,
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Bounded excerpt attached to outbound `message` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub recent_memories: Vec<MemoryRecord>,
    pub current_mood: String,
    pub conversation_history: Vec<ChatMessage>,
}

// ── Connection ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ── Wire protocol ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireKind {
    Message,
    Typing,
    Suggestions,
    System,
    Heartbeat,
}

/// One frame on the bidirectional channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: WireKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<Token>,
}

impl WireMessage {
    pub fn new(kind: WireKind, payload: serde_json::Value, timestamp: i64) -> Self {
        WireMessage { kind, payload, timestamp, message_id: None, user_id: None, token: None }
    }
}

// ── Push feed ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Memories,
    Insights,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 2] = [CollectionKind::Memories, CollectionKind::Insights];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Memories => "memories",
            CollectionKind::Insights => "insights",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document from either pushed collection.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedDocument {
    Memory(MemoryRecord),
    Insight(InsightRecord),
}

/// Normalized change notification from a push feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Added(FeedDocument),
    Modified(FeedDocument),
    Removed(String),
    InitialSnapshotComplete,
}
