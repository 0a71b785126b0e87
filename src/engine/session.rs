// Cziczere Sync Engine: Sync Session
//
// Wires one user session together: connection manager, correlator, push
// feed multiplexer, optimistic tracker and state store.
//
// Lifecycle per identity:
//   identity change → full teardown (routers, socket, pending calls,
//   subscriptions, optimistic ledger) → IdentityChanged → connect +
//   subscribe for the new identity.
//
// Routing:
//   feed memories  : buffered until the initial snapshot completes, then
//                    Added → reconcile, Modified → Update, Removed → Delete
//   feed insights  : same shape with InsightsLoaded / InsightAdded / InsightRemoved
//   channel        : message → correlator + ChatMessageReceived,
//                    typing / suggestions / system → chat state
//   connection     : every state → ConnectionChanged; Failed → SetError once

use crate::atoms::constants::{CONTEXT_RECENT_MEMORIES, CONTEXT_RECENT_TURNS};
use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::traits::{CredentialSource, DocumentFeed, GardenApi, SocketConnector};
use crate::atoms::types::{
    AtmosphereData, ChangeEvent, ChatKind, ChatMessage, ChatSender, CollectionKind, ConnectionState,
    ConversationContext, FeedDocument, InsightRecord, MemoryRecord, Token, UserId, WireKind, WireMessage,
};
use crate::engine::config::SyncConfig;
use crate::engine::connection::ConnectionManager;
use crate::engine::correlator::MessageCorrelator;
use crate::engine::feed::{FeedEnvelope, PushFeedMultiplexer};
use crate::engine::optimistic::OptimisticTracker;
use crate::engine::store::{selectors, Action, ApplicationSnapshot, StateStore};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

/// Words the suggestion request reports as recent conversation topics.
const TOPIC_KEYWORDS: [&str; 6] = ["memory", "feeling", "garden", "reflect", "mood", "thought"];

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn label(identity: &Option<UserId>) -> &str {
    identity.as_ref().map(|u| u.as_str()).unwrap_or("<signed out>")
}

/// Initial-load buffers; `Some` until that collection's snapshot completes.
#[derive(Default)]
struct FeedBuffers {
    memories: Option<Vec<MemoryRecord>>,
    insights: Option<Vec<InsightRecord>>,
}

struct SessionInner {
    config: SyncConfig,
    credentials: Arc<dyn CredentialSource>,
    api: Arc<dyn GardenApi>,
    store: Arc<StateStore>,
    connection: ConnectionManager,
    correlator: Arc<MessageCorrelator>,
    feed: PushFeedMultiplexer,
    tracker: Arc<OptimisticTracker>,
    /// Tasks that live for one identity: channel router, connection watcher.
    scoped: Mutex<Vec<JoinHandle<()>>>,
    buffers: Mutex<FeedBuffers>,
    /// Serializes identity transitions.
    transition: tokio::sync::Mutex<()>,
}

pub struct SyncSession {
    inner: Arc<SessionInner>,
    /// Tasks that live for the whole session.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncSession {
    /// Build every component and start the background tasks. Must be called
    /// inside a tokio runtime.
    pub fn start(
        config: SyncConfig,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn SocketConnector>,
        feed: Arc<dyn DocumentFeed>,
        api: Arc<dyn GardenApi>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let store = Arc::new(StateStore::new(config.store_limits()));
        let connection = ConnectionManager::new(config.connection_settings(), Arc::clone(&credentials), connector);
        let correlator = Arc::new(MessageCorrelator::new(config.message_timeout()));
        let feed = PushFeedMultiplexer::new(feed);
        let events = feed
            .take_events()
            .ok_or_else(|| SyncError::Other("feed event channel already taken".into()))?;
        let tracker = Arc::new(OptimisticTracker::new(Arc::clone(&store), config.optimistic_grace()));
        let sweep_interval = config.sweep_interval();

        let inner = Arc::new(SessionInner {
            config,
            credentials,
            api,
            store,
            connection,
            correlator,
            feed,
            tracker,
            scoped: Mutex::new(Vec::new()),
            buffers: Mutex::new(FeedBuffers::default()),
            transition: tokio::sync::Mutex::new(()),
        });

        let background = vec![
            inner.correlator.spawn_sweeper(sweep_interval),
            inner.tracker.spawn_grace_sweeper(sweep_interval),
            tokio::spawn(route_feed(Arc::clone(&inner), events)),
            tokio::spawn(watch_identity(Arc::clone(&inner))),
        ];
        info!("[session] Started");
        Ok(SyncSession { inner, background: Mutex::new(background) })
    }

    // ── Read surface ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<ApplicationSnapshot> {
        self.inner.store.snapshot()
    }

    pub fn observe(&self) -> WatchStream<Arc<ApplicationSnapshot>> {
        self.inner.store.observe()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ApplicationSnapshot>> {
        self.inner.store.subscribe()
    }

    pub fn dispatch(&self, action: Action) -> bool {
        self.inner.store.dispatch(action)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // ── Write surface ──────────────────────────────────────────────────────

    /// Show `text` as a pending memory now, then create it on the backend.
    /// The draft is reconciled with the response, or marked Failed.
    pub async fn create_memory_optimistic(&self, text: &str) -> SyncResult<MemoryRecord> {
        let inner = &self.inner;
        let (owner, token) = inner.require_identity().await?;
        let fingerprint = inner.tracker.begin_optimistic(MemoryRecord::draft(owner.clone(), text, 0));

        match inner.api.create_memory(&token, text, &fingerprint.nonce).await {
            Ok(record) => {
                if !inner.is_identity(&owner) {
                    return Err(SyncError::Cancelled);
                }
                inner.tracker.reconcile_with(&fingerprint, record.clone());
                Ok(record)
            }
            Err(e) => {
                warn!("[session] create memory failed: {}", e);
                inner.tracker.fail(&fingerprint);
                inner.store.dispatch(Action::SetError(e.to_string()));
                Err(e)
            }
        }
    }

    /// Send a chat message with a bounded context excerpt and wait for the
    /// correlated reply.
    pub async fn send_chat(&self, text: &str) -> SyncResult<ChatMessage> {
        let inner = &self.inner;
        let (owner, token) = inner.require_identity().await?;
        let snapshot = inner.store.snapshot();

        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: text.to_string(),
            sender: ChatSender::User,
            timestamp: now_ms(),
            kind: ChatKind::Text,
            metadata: None,
        };
        let payload = json!({ "message": message, "context": conversation_context(&snapshot) });
        let mut wire = WireMessage::new(WireKind::Message, payload, now_ms());
        wire.user_id = Some(owner);
        wire.token = Some(token);

        let (id, reply) = inner.correlator.issue(&mut wire, true);
        if let Err(e) = inner.connection.send(&wire).await {
            inner.correlator.forget(&id);
            return Err(e);
        }
        inner.store.dispatch(Action::ChatMessageReceived(message));

        let response = reply.await.map_err(|_| SyncError::Cancelled)??;
        Ok(serde_json::from_value::<ChatMessage>(response.payload)?)
    }

    pub async fn send_typing(&self, is_typing: bool) -> SyncResult<()> {
        let owner = self.inner.store.snapshot().identity.clone();
        let mut wire = WireMessage::new(WireKind::Typing, json!({ "isTyping": is_typing }), now_ms());
        wire.user_id = owner;
        self.inner.connection.send(&wire).await
    }

    /// Fire-and-forget; suggestions arrive through the snapshot.
    pub async fn request_suggestions(&self) -> SyncResult<()> {
        let snapshot = self.inner.store.snapshot();
        let payload = json!({
            "action": "request",
            "context": {
                "currentMood": selectors::dominant_mood(&snapshot),
                "recentTopics": recent_topics(&snapshot.chat.history),
            }
        });
        let wire = WireMessage::new(WireKind::Suggestions, payload, now_ms());
        self.inner.connection.send(&wire).await
    }

    /// Cached atmosphere when fresh, otherwise fetched and cached.
    pub async fn refresh_atmosphere(&self, force: bool) -> SyncResult<AtmosphereData> {
        let inner = &self.inner;
        let snapshot = inner.store.snapshot();
        if !force && !selectors::atmosphere_is_stale(&snapshot, now_ms()) {
            if let Some(cached) = &snapshot.atmosphere {
                debug!("[session] atmosphere cache hit");
                return Ok(cached.clone());
            }
        }

        let (owner, token) = inner.require_identity().await?;
        let data = match inner.api.get_atmosphere(&token).await {
            Ok(data) => data,
            Err(e) => {
                warn!("[session] atmosphere refresh failed: {}", e);
                inner.store.dispatch(Action::SetError(e.to_string()));
                return Err(e);
            }
        };
        if !inner.is_identity(&owner) {
            return Err(SyncError::Cancelled);
        }
        inner.store.dispatch(Action::AtmosphereUpdated { data: data.clone(), at_ms: now_ms() });
        Ok(data)
    }

    /// Restart both feed subscriptions for the current identity. Returns
    /// how many were restarted.
    pub async fn retry_subscriptions(&self) -> usize {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;
        if inner.feed.owner().is_none() {
            return 0;
        }
        let mut restarted = 0;
        for kind in CollectionKind::ALL {
            {
                let mut buffers = inner.buffers.lock();
                match kind {
                    CollectionKind::Memories => buffers.memories = Some(Vec::new()),
                    CollectionKind::Insights => buffers.insights = Some(Vec::new()),
                }
            }
            inner.store.dispatch(match kind {
                CollectionKind::Memories => Action::LoadStart,
                CollectionKind::Insights => Action::InsightsLoadStart,
            });
            if inner.feed.resubscribe(kind).await {
                restarted += 1;
            }
        }
        info!("[session] Restarted {} subscription(s)", restarted);
        restarted
    }

    /// Start the connection supervisor again, e.g. after it gave up.
    pub fn reconnect(&self) {
        self.inner.connection.connect();
    }

    /// Stop every task and release every resource.
    pub async fn shutdown(&self) {
        let background: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in background {
            handle.abort();
            let _ = handle.await;
        }
        let _guard = self.inner.transition.lock().await;
        self.inner.teardown().await;
        info!("[session] Shut down");
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
        for handle in self.inner.scoped.lock().drain(..) {
            handle.abort();
        }
        self.inner.connection.disconnect();
    }
}

// ── Identity lifecycle ─────────────────────────────────────────────────────

async fn watch_identity(inner: Arc<SessionInner>) {
    let mut identities = inner.credentials.identity_changes();
    let mut current = identities.borrow_and_update().clone();
    {
        let _guard = inner.transition.lock().await;
        inner.activate(current.clone()).await;
    }

    while identities.changed().await.is_ok() {
        let next = identities.borrow_and_update().clone();
        if next == current {
            continue;
        }
        info!("[session] Identity {} → {}", label(&current), label(&next));
        let _guard = inner.transition.lock().await;
        inner.teardown().await;
        inner.activate(next.clone()).await;
        current = next;
    }
}

impl SessionInner {
    async fn require_identity(&self) -> SyncResult<(UserId, Token)> {
        let owner = self
            .store
            .snapshot()
            .identity
            .clone()
            .ok_or_else(|| SyncError::Auth("signed out".into()))?;
        let token = self
            .credentials
            .current_token()
            .await?
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SyncError::Auth("no credential available".into()))?;
        Ok((owner, token))
    }

    fn is_identity(&self, owner: &UserId) -> bool {
        self.store.snapshot().identity.as_ref() == Some(owner)
    }

    /// Release everything scoped to the current identity. Returns the number
    /// of feed subscriptions torn down.
    async fn teardown(&self) -> usize {
        let scoped: Vec<JoinHandle<()>> = self.scoped.lock().drain(..).collect();
        for handle in scoped {
            handle.abort();
            let _ = handle.await;
        }
        self.connection.disconnect();
        self.store.dispatch(Action::ConnectionChanged(self.connection.state()));
        let cancelled = self.correlator.cancel_all();
        let subscriptions = self.feed.teardown().await;
        let drafts = self.tracker.reset();
        *self.buffers.lock() = FeedBuffers::default();
        info!(
            "[session] Teardown: {} subscription(s), {} pending call(s), {} optimistic write(s)",
            subscriptions, cancelled, drafts
        );
        subscriptions
    }

    async fn activate(self: &Arc<Self>, identity: Option<UserId>) {
        self.store.dispatch(Action::IdentityChanged(identity.clone()));
        let Some(user) = identity else {
            debug!("[session] Signed out, nothing to start");
            return;
        };

        *self.buffers.lock() = FeedBuffers { memories: Some(Vec::new()), insights: Some(Vec::new()) };
        self.store.dispatch(Action::LoadStart);
        self.store.dispatch(Action::InsightsLoadStart);

        // Subscribe before connecting so nothing inbound is missed.
        let inbound = self.connection.inbound();
        let states = self.connection.states();
        let router = tokio::spawn(route_channel(Arc::clone(self), inbound));
        let watcher = tokio::spawn(watch_connection(Arc::clone(self), states));
        self.scoped.lock().extend([router, watcher]);

        self.connection.connect();
        self.feed.switch_identity(Some(user.clone())).await;
        info!("[session] Active for {}", user);
    }

    // ── Channel routing ────────────────────────────────────────────────────

    fn route_wire(&self, message: WireMessage) {
        if let Some(id) = message.message_id.as_deref() {
            self.correlator.resolve(id, message.clone());
        }

        let payload = &message.payload;
        match message.kind {
            WireKind::Message => match serde_json::from_value::<ChatMessage>(payload.clone()) {
                Ok(chat) => {
                    self.store.dispatch(Action::ChatMessageReceived(chat));
                }
                Err(e) => warn!("[session] undecodable chat message: {}", e),
            },
            WireKind::Typing => {
                if let Some(typing) = payload.get("isTyping").and_then(|v| v.as_bool()) {
                    self.store.dispatch(Action::TypingChanged(typing));
                }
            }
            WireKind::Suggestions => {
                let suggestions: Vec<String> = payload
                    .get("suggestions")
                    .and_then(|v| v.as_array())
                    .map(|items| items.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                self.store.dispatch(Action::SuggestionsReceived(suggestions));
            }
            WireKind::System => {
                let text = payload
                    .get("message")
                    .or_else(|| payload.get("text"))
                    .and_then(|v| v.as_str());
                if let Some(text) = text {
                    self.store.dispatch(Action::SystemNotice(text.to_string()));
                }
            }
            WireKind::Heartbeat => {}
        }
    }

    // ── Feed routing ───────────────────────────────────────────────────────

    fn apply_feed(&self, kind: CollectionKind, item: SyncResult<ChangeEvent>) {
        let event = match item {
            Ok(event) => event,
            Err(e) => {
                let message = e.to_string();
                warn!("[session] {} feed failed: {}", kind, message);
                match kind {
                    CollectionKind::Memories => {
                        self.buffers.lock().memories = None;
                        self.store.dispatch(Action::LoadError(message));
                    }
                    CollectionKind::Insights => {
                        self.buffers.lock().insights = None;
                        self.store.dispatch(Action::SetError(message));
                    }
                }
                return;
            }
        };
        match kind {
            CollectionKind::Memories => self.apply_memory_event(event),
            CollectionKind::Insights => self.apply_insight_event(event),
        }
    }

    fn apply_memory_event(&self, event: ChangeEvent) {
        let mut buffers = self.buffers.lock();
        if let Some(mut buffer) = buffers.memories.take() {
            if buffer_memory_event(&mut buffer, event) {
                drop(buffers);
                debug!("[session] memories snapshot complete ({} records)", buffer.len());
                self.tracker.load_snapshot(buffer);
            } else {
                buffers.memories = Some(buffer);
            }
            return;
        }
        drop(buffers);

        match event {
            ChangeEvent::Added(FeedDocument::Memory(record)) => {
                self.tracker.reconcile(record);
            }
            ChangeEvent::Modified(FeedDocument::Memory(record)) => {
                self.store.dispatch(Action::Update(record));
            }
            ChangeEvent::Removed(id) => {
                self.store.dispatch(Action::Delete(id));
            }
            ChangeEvent::InitialSnapshotComplete => debug!("[session] repeated memories snapshot marker"),
            other => warn!("[session] unexpected document on memories feed: {:?}", other),
        }
    }

    fn apply_insight_event(&self, event: ChangeEvent) {
        let mut buffers = self.buffers.lock();
        if let Some(mut buffer) = buffers.insights.take() {
            if buffer_insight_event(&mut buffer, event) {
                drop(buffers);
                self.store.dispatch(Action::InsightsLoaded(buffer));
            } else {
                buffers.insights = Some(buffer);
            }
            return;
        }
        drop(buffers);

        match event {
            ChangeEvent::Added(FeedDocument::Insight(insight))
            | ChangeEvent::Modified(FeedDocument::Insight(insight)) => {
                self.store.dispatch(Action::InsightAdded(insight));
            }
            ChangeEvent::Removed(id) => {
                self.store.dispatch(Action::InsightRemoved(id));
            }
            ChangeEvent::InitialSnapshotComplete => debug!("[session] repeated insights snapshot marker"),
            other => warn!("[session] unexpected document on insights feed: {:?}", other),
        }
    }
}

/// Apply one event to the initial-load buffer. Returns true on completion.
fn buffer_memory_event(buffer: &mut Vec<MemoryRecord>, event: ChangeEvent) -> bool {
    match event {
        ChangeEvent::Added(FeedDocument::Memory(record)) | ChangeEvent::Modified(FeedDocument::Memory(record)) => {
            match buffer.iter_mut().find(|m| m.id.is_some() && m.id == record.id) {
                Some(existing) => *existing = record,
                None => buffer.push(record),
            }
        }
        ChangeEvent::Removed(id) => buffer.retain(|m| m.id.as_deref() != Some(id.as_str())),
        ChangeEvent::InitialSnapshotComplete => return true,
        other => warn!("[session] unexpected document on memories feed: {:?}", other),
    }
    false
}

fn buffer_insight_event(buffer: &mut Vec<InsightRecord>, event: ChangeEvent) -> bool {
    match event {
        ChangeEvent::Added(FeedDocument::Insight(insight))
        | ChangeEvent::Modified(FeedDocument::Insight(insight)) => {
            buffer.retain(|i| i.id != insight.id);
            buffer.push(insight);
        }
        ChangeEvent::Removed(id) => buffer.retain(|i| i.id != id),
        ChangeEvent::InitialSnapshotComplete => return true,
        other => warn!("[session] unexpected document on insights feed: {:?}", other),
    }
    false
}

// ── Router tasks ───────────────────────────────────────────────────────────

async fn route_feed(inner: Arc<SessionInner>, mut events: mpsc::Receiver<FeedEnvelope>) {
    while let Some(envelope) = events.recv().await {
        if !inner.feed.is_current(envelope.generation) {
            debug!("[session] dropping {} event from generation {}", envelope.kind, envelope.generation);
            continue;
        }
        inner.apply_feed(envelope.kind, envelope.item);
    }
}

async fn route_channel(inner: Arc<SessionInner>, mut inbound: broadcast::Receiver<WireMessage>) {
    loop {
        match inbound.recv().await {
            Ok(message) => inner.route_wire(message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("[session] channel router lagged, {} message(s) skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn watch_connection(inner: Arc<SessionInner>, mut states: watch::Receiver<ConnectionState>) {
    let mut reported = false;
    loop {
        let state = *states.borrow_and_update();
        inner.store.dispatch(Action::ConnectionChanged(state));
        match state {
            ConnectionState::Failed if !reported => {
                let attempts = inner.config.max_reconnect_attempts;
                inner.store.dispatch(Action::SetError(SyncError::ReconnectExhausted { attempts }.to_string()));
                reported = true;
            }
            ConnectionState::Connected => reported = false,
            _ => {}
        }
        if states.changed().await.is_err() {
            break;
        }
    }
}

// ── Outbound context ───────────────────────────────────────────────────────

fn conversation_context(snapshot: &ApplicationSnapshot) -> ConversationContext {
    let history = &snapshot.chat.history;
    let start = history.len().saturating_sub(CONTEXT_RECENT_TURNS);
    ConversationContext {
        recent_memories: selectors::recent_memories(snapshot, CONTEXT_RECENT_MEMORIES).to_vec(),
        current_mood: selectors::dominant_mood(snapshot),
        conversation_history: history[start..].to_vec(),
    }
}

fn recent_topics(history: &[ChatMessage]) -> Vec<&'static str> {
    let text = history
        .iter()
        .filter(|m| m.kind == ChatKind::Text)
        .map(|m| m.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    TOPIC_KEYWORDS.iter().copied().filter(|w| text.contains(w)).collect()
}
