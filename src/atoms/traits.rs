// ── Cziczere Atoms: Collaborator Traits ─────────────────────────────────────
// Seams between the engine and the outside world. Each trait has one
// production implementation in engine/ and an in-memory one for tests.

use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::types::{AtmosphereData, ChangeEvent, CollectionKind, MemoryRecord, Token, UserId};
use async_trait::async_trait;
use futures::{Sink, Stream};
use std::pin::Pin;
use tokio::sync::watch;

/// Outbound half of an open socket: text frames in, socket errors out.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;

/// Inbound half of an open socket. The stream ending, or yielding an error,
/// means the socket is closed.
pub type FrameStream = Pin<Box<dyn Stream<Item = SyncResult<String>> + Send>>;

/// Raw change notifications for one collection. An `Err` item is terminal.
pub type ChangeStream = Pin<Box<dyn Stream<Item = SyncResult<ChangeEvent>> + Send>>;

// ── Credential source ──────────────────────────────────────────────────────

/// Supplies the bearer token and the signed-in identity.
/// Authentication itself happens elsewhere; the engine only consumes these.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current token, `None` when signed out. Called on every (re)connect
    /// because tokens rotate.
    async fn current_token(&self) -> SyncResult<Option<Token>>;

    /// Identity stream. The receiver's current value is the identity now.
    fn identity_changes(&self) -> watch::Receiver<Option<UserId>>;
}

// ── Bidirectional channel ──────────────────────────────────────────────────

/// Opens sockets. The URL already carries the handshake credential.
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn open(&self, url: &str) -> SyncResult<(FrameSink, FrameStream)>;
}

// ── Push feed backend ──────────────────────────────────────────────────────

/// A document store's change-notification API, filtered by owner server-side.
#[async_trait]
pub trait DocumentFeed: Send + Sync {
    async fn open(&self, owner: &UserId, kind: CollectionKind) -> SyncResult<ChangeStream>;
}

// ── One-shot backend calls ────────────────────────────────────────────────

/// The one-shot calls the engine composes with its own state: the create
/// call behind optimistic writes and the atmosphere refresh.
#[async_trait]
pub trait GardenApi: Send + Sync {
    /// Create a memory from `text`. `client_ref` is echoed back by the backend
    /// so the authoritative record can be matched to its optimistic draft.
    async fn create_memory(&self, token: &Token, text: &str, client_ref: &str) -> SyncResult<MemoryRecord>;

    async fn get_atmosphere(&self, token: &Token) -> SyncResult<AtmosphereData>;
}
