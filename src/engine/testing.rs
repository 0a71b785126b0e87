// In-memory collaborators for unit tests: a socket connector whose server
// side is driven by the test, a document feed with push handles, and a
// scripted garden API.

use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::traits::{ChangeStream, DocumentFeed, FrameSink, FrameStream, GardenApi, SocketConnector};
use crate::atoms::types::{AtmosphereData, ChangeEvent, CollectionKind, MemoryRecord, Token, UserId};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ── Socket ─────────────────────────────────────────────────────────────────

/// Server end of one mock socket.
pub struct MockSocket {
    pub url: String,
    pub from_client: fmpsc::UnboundedReceiver<String>,
    pub to_client: fmpsc::UnboundedSender<SyncResult<String>>,
}

impl MockSocket {
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.to_client.unbounded_send(Ok(frame.into()));
    }

    /// Next frame the client wrote.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Server-side close.
    pub fn close(self) {}
}

pub struct MockConnector {
    refuse: AtomicBool,
    opened: AtomicUsize,
    sockets: mpsc::UnboundedSender<MockSocket>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSocket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = MockConnector { refuse: AtomicBool::new(false), opened: AtomicUsize::new(0), sockets: tx };
        (Arc::new(connector), rx)
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Open attempts so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketConnector for MockConnector {
    async fn open(&self, url: &str) -> SyncResult<(FrameSink, FrameStream)> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::socket("connection refused"));
        }
        let (client_tx, server_rx) = fmpsc::unbounded::<String>();
        let (server_tx, client_rx) = fmpsc::unbounded::<SyncResult<String>>();
        let socket = MockSocket { url: url.to_string(), from_client: server_rx, to_client: server_tx };
        self.sockets.send(socket).map_err(|_| SyncError::socket("mock server gone"))?;
        let sink: FrameSink = Box::pin(client_tx.sink_map_err(SyncError::socket));
        let stream: FrameStream = Box::pin(client_rx);
        Ok((sink, stream))
    }
}

// ── Document feed ──────────────────────────────────────────────────────────

type FeedKey = (UserId, CollectionKind);

struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockFeed {
    senders: Mutex<HashMap<FeedKey, fmpsc::UnboundedSender<SyncResult<ChangeEvent>>>>,
    opened: watch::Sender<usize>,
    closed: Arc<AtomicUsize>,
    /// (owner, subscriptions closed so far) at every open.
    open_log: Mutex<Vec<(UserId, usize)>>,
    fail_open: AtomicBool,
}

impl MockFeed {
    pub fn new() -> Arc<Self> {
        let (opened, _) = watch::channel(0);
        Arc::new(MockFeed {
            senders: Mutex::new(HashMap::new()),
            opened,
            closed: Arc::new(AtomicUsize::new(0)),
            open_log: Mutex::new(Vec::new()),
            fail_open: AtomicBool::new(false),
        })
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Deliver `event` to the open subscription for `(owner, kind)`.
    pub fn push(&self, owner: &str, kind: CollectionKind, event: SyncResult<ChangeEvent>) -> bool {
        let senders = self.senders.lock();
        match senders.get(&(UserId::new(owner), kind)) {
            Some(tx) => tx.unbounded_send(event).is_ok(),
            None => false,
        }
    }

    pub fn opened(&self) -> usize {
        *self.opened.borrow()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn open_log(&self) -> Vec<(UserId, usize)> {
        self.open_log.lock().clone()
    }

    pub async fn wait_opened(&self, count: usize) {
        let mut rx = self.opened.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl DocumentFeed for MockFeed {
    async fn open(&self, owner: &UserId, kind: CollectionKind) -> SyncResult<ChangeStream> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SyncError::subscription(kind.as_str(), "permission denied"));
        }
        let (tx, rx) = fmpsc::unbounded();
        self.senders.lock().insert((owner.clone(), kind), tx);
        self.open_log.lock().push((owner.clone(), self.closed()));
        self.opened.send_modify(|n| *n += 1);
        let guard = DropCounter(Arc::clone(&self.closed));
        Ok(Box::pin(rx.map(move |event| {
            let _held = &guard;
            event
        })))
    }
}

// ── Garden API ─────────────────────────────────────────────────────────────

pub struct MockGardenApi {
    fail: AtomicBool,
    echo_client_ref: AtomicBool,
    calls: AtomicUsize,
    atmosphere_calls: AtomicUsize,
}

impl MockGardenApi {
    pub fn new() -> Arc<Self> {
        Arc::new(MockGardenApi {
            fail: AtomicBool::new(false),
            echo_client_ref: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            atmosphere_calls: AtomicUsize::new(0),
        })
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn echo_client_ref(&self, echo: bool) {
        self.echo_client_ref.store(echo, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn atmosphere_calls(&self) -> usize {
        self.atmosphere_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GardenApi for MockGardenApi {
    async fn create_memory(&self, _token: &Token, text: &str, client_ref: &str) -> SyncResult<MemoryRecord> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::api("generateMemoryPlant", 500, "backend unavailable"));
        }
        let mut record = MemoryRecord::draft(UserId::new("server"), text, 0);
        record.id = Some(format!("created-{}", n + 1));
        if self.echo_client_ref.load(Ordering::SeqCst) {
            record.client_ref = Some(client_ref.to_string());
        }
        record.emotions.insert("joy".into(), 0.7);
        Ok(record)
    }

    async fn get_atmosphere(&self, _token: &Token) -> SyncResult<AtmosphereData> {
        self.atmosphere_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AtmosphereData { mood: "serene".into(), weather: Some("sunny".into()), ..Default::default() })
    }
}
