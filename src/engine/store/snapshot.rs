// Cziczere Sync Engine: Application Snapshot
//
// The immutable aggregate every observer reads. Shared as
// `Arc<ApplicationSnapshot>`; a new value is built for every applied action.

use crate::atoms::constants::{INSIGHT_RING_SIZE, MAX_CONVERSATION_HISTORY, MAX_MEMORIES};
use crate::atoms::types::{
    AtmosphereData, ChatMessage, ConnectionState, InsightRecord, MemoryRecord, UserId,
};
use serde::Serialize;

/// Chat-channel view state.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatState {
    /// Oldest first, bounded by `StoreLimits::max_history`.
    pub history: Vec<ChatMessage>,
    pub typing: bool,
    pub suggestions: Vec<String>,
    pub system_notice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSnapshot {
    /// Bumped on every applied change.
    pub revision: u64,
    pub identity: Option<UserId>,
    /// Newest first.
    pub memories: Vec<MemoryRecord>,
    /// Newest first, ring-bounded.
    pub insights: Vec<InsightRecord>,
    pub atmosphere: Option<AtmosphereData>,
    /// Epoch milliseconds of the last atmosphere refresh.
    pub atmosphere_refreshed_at: Option<i64>,
    pub chat: ChatState,
    pub connection: ConnectionState,
    /// Terminal error surfaced once; stays until `ClearError`.
    pub error: Option<String>,
    pub memories_loading: bool,
    pub insights_loading: bool,
}

/// List bounds the reducer enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_memories: usize,
    pub insight_ring: usize,
    pub max_history: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        StoreLimits {
            max_memories: MAX_MEMORIES,
            insight_ring: INSIGHT_RING_SIZE,
            max_history: MAX_CONVERSATION_HISTORY,
        }
    }
}
