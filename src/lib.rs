// Cziczere Sync: client-side synchronization engine for the memory garden.
//
// atoms/   pure data: types, errors, constants, collaborator traits
// engine/  everything with I/O or tasks: connection, feeds, store, session

pub mod atoms;
pub mod engine;

pub use atoms::error::{SyncError, SyncResult};
pub use atoms::types::{
    ChatMessage, ConnectionState, InsightRecord, MemoryRecord, SyncStatus, Token, UserId,
};
pub use engine::{
    Action, ApplicationSnapshot, HttpApi, SseDocumentFeed, StaticCredentials, SyncConfig, SyncSession,
    TungsteniteConnector,
};
