// Cziczere Sync Engine: Connection Manager
//
// Owns one logical WebSocket connection to the chat backend:
//   • connect: fetch credential → open socket with `?token=` → Connected →
//     initial heartbeat
//   • heartbeat: independent ticker task; two intervals with no inbound
//     frame marks the socket stale and forces a reconnect
//   • reconnect: fixed delay between attempts, counter resets on every
//     successful open; after the configured maximum → Failed, no more
//     automatic attempts until `connect` is called again
//   • send: fails fast with NotConnected; nothing is queued for later
//
// All state changes go through the pure `ConnectionState::on` transition.

use crate::atoms::constants::{
    DEFAULT_WS_URL, HEARTBEAT_INTERVAL_MS, HEARTBEAT_STALE_FACTOR, INBOUND_BROADCAST_CAPACITY,
    MAX_RECONNECT_ATTEMPTS, OUTBOUND_QUEUE_CAPACITY, RECONNECT_INTERVAL_MS,
};
use crate::atoms::error::{SyncError, SyncResult};
use crate::atoms::traits::{CredentialSource, FrameSink, FrameStream, SocketConnector};
use crate::atoms::types::{ConnectionState, WireKind, WireMessage};
use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

// ── State machine ──────────────────────────────────────────────────────────

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Opened,
    Closed,
    HeartbeatTimeout,
    Exhausted,
    Disconnect,
}

impl ConnectionState {
    /// Next state after `event`. Events that do not apply leave the state as is.
    pub fn on(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent as E;
        use ConnectionState as S;
        match (self, event) {
            (_, E::Disconnect) => S::Disconnected,
            (S::Disconnected | S::Failed, E::Connect) => S::Connecting,
            (S::Connecting | S::Reconnecting, E::Opened) => S::Connected,
            (S::Connecting | S::Connected | S::Reconnecting, E::Closed) => S::Reconnecting,
            (S::Connected, E::HeartbeatTimeout) => S::Reconnecting,
            (S::Connecting | S::Reconnecting, E::Exhausted) => S::Failed,
            (state, _) => state,
        }
    }
}

// ── Settings ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub url: String,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            url: DEFAULT_WS_URL.to_string(),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            reconnect_interval: Duration::from_millis(RECONNECT_INTERVAL_MS),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ConnectionSettings {
    fn stale_after(&self) -> Duration {
        self.heartbeat_interval * HEARTBEAT_STALE_FACTOR
    }
}

// ── Manager ────────────────────────────────────────────────────────────────

struct Shared {
    settings: ConnectionSettings,
    credentials: Arc<dyn CredentialSource>,
    connector: Arc<dyn SocketConnector>,
    state: watch::Sender<ConnectionState>,
    /// Present only while a socket is open.
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    inbound: broadcast::Sender<WireMessage>,
}

impl Shared {
    fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let mut transition = None;
        self.state.send_if_modified(|state| {
            let next = state.on(event);
            if next == *state {
                return false;
            }
            transition = Some((*state, next));
            *state = next;
            true
        });
        if let Some((from, to)) = transition {
            info!("[conn] {} → {} ({:?})", from, to, event);
        }
        *self.state.borrow()
    }
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        credentials: Arc<dyn CredentialSource>,
        connector: Arc<dyn SocketConnector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound, _) = broadcast::channel(INBOUND_BROADCAST_CAPACITY);
        ConnectionManager {
            shared: Arc::new(Shared {
                settings,
                credentials,
                connector,
                state,
                outbound: Mutex::new(None),
                inbound,
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Start the supervisor. Idempotent while one is running.
    pub fn connect(&self) -> watch::Receiver<ConnectionState> {
        let mut supervisor = self.supervisor.lock();
        let running = supervisor.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if !running {
            self.shared.apply(ConnectionEvent::Connect);
            let shared = Arc::clone(&self.shared);
            *supervisor = Some(tokio::spawn(supervise(shared)));
        }
        self.shared.state.subscribe()
    }

    /// Stop everything. Safe to call any number of times.
    pub fn disconnect(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.shared.outbound.lock().take();
        self.shared.apply(ConnectionEvent::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn states(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Decoded inbound messages, heartbeats excluded.
    pub fn inbound(&self) -> broadcast::Receiver<WireMessage> {
        self.shared.inbound.subscribe()
    }

    /// Serialize and hand `message` to the open socket.
    pub async fn send(&self, message: &WireMessage) -> SyncResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(SyncError::NotConnected);
        }
        let Some(tx) = self.shared.outbound.lock().clone() else {
            return Err(SyncError::NotConnected);
        };
        let frame = serde_json::to_string(message)?;
        tx.send(frame).await.map_err(|_| SyncError::NotConnected)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

// ── Supervisor ─────────────────────────────────────────────────────────────

/// Why an open socket stopped being used.
#[derive(Debug)]
enum SessionEnd {
    Closed,
    Stale,
    Error(SyncError),
}

async fn supervise(shared: Arc<Shared>) {
    let max = shared.settings.max_reconnect_attempts;
    let mut failures: u32 = 0;

    loop {
        match open_socket(&shared).await {
            Ok((sink, stream)) => {
                failures = 0;
                shared.apply(ConnectionEvent::Opened);
                let end = run_socket(&shared, sink, stream).await;
                shared.outbound.lock().take();
                match end {
                    SessionEnd::Stale => {
                        warn!("[conn] No traffic for {:?}, socket is stale", shared.settings.stale_after());
                        shared.apply(ConnectionEvent::HeartbeatTimeout);
                    }
                    SessionEnd::Closed => {
                        info!("[conn] Socket closed by peer");
                        shared.apply(ConnectionEvent::Closed);
                    }
                    SessionEnd::Error(e) => {
                        warn!("[conn] Socket error: {}", e);
                        shared.apply(ConnectionEvent::Closed);
                    }
                }
            }
            Err(e) => {
                failures += 1;
                warn!("[conn] Connect attempt {}/{} failed: {}", failures, max, e);
                shared.apply(ConnectionEvent::Closed);
                if failures >= max {
                    error!("[conn] {}", SyncError::ReconnectExhausted { attempts: failures });
                    shared.apply(ConnectionEvent::Exhausted);
                    return;
                }
            }
        }

        debug!("[conn] Reconnecting in {:?}", shared.settings.reconnect_interval);
        tokio::time::sleep(shared.settings.reconnect_interval).await;
    }
}

async fn open_socket(shared: &Shared) -> SyncResult<(FrameSink, FrameStream)> {
    let token = shared
        .credentials
        .current_token()
        .await?
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SyncError::Auth("no credential available".into()))?;

    let mut url = url::Url::parse(&shared.settings.url)?;
    url.query_pairs_mut().append_pair("token", token.expose());

    debug!("[conn] Opening {}", shared.settings.url);
    shared.connector.open(url.as_str()).await
}

/// Aborts the wrapped task when dropped.
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn heartbeat_frame() -> SyncResult<String> {
    let beat = WireMessage::new(WireKind::Heartbeat, serde_json::json!({}), chrono::Utc::now().timestamp_millis());
    Ok(serde_json::to_string(&beat)?)
}

async fn run_socket(shared: &Shared, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_CAPACITY);
    *shared.outbound.lock() = Some(out_tx);

    let initial = match heartbeat_frame() {
        Ok(frame) => frame,
        Err(e) => return SessionEnd::Error(e),
    };
    if let Err(e) = sink.send(initial).await {
        return SessionEnd::Error(e);
    }

    // Heartbeat ticker
    let interval = shared.settings.heartbeat_interval;
    let (tick_tx, mut tick_rx) = mpsc::channel::<()>(1);
    let _ticker = TaskGuard(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            if tick_tx.send(()).await.is_err() {
                break;
            }
        }
    }));

    let stale_after = shared.settings.stale_after();
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(text)) => {
                    last_seen = Instant::now();
                    dispatch_inbound(shared, &text);
                }
                Some(Err(e)) => return SessionEnd::Error(e),
                None => return SessionEnd::Closed,
            },
            Some(frame) = out_rx.recv() => {
                if let Err(e) = sink.send(frame).await {
                    return SessionEnd::Error(e);
                }
            }
            Some(()) = tick_rx.recv() => {
                if last_seen.elapsed() >= stale_after {
                    let _ = sink.close().await;
                    return SessionEnd::Stale;
                }
                match heartbeat_frame() {
                    Ok(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            return SessionEnd::Error(e);
                        }
                    }
                    Err(e) => return SessionEnd::Error(e),
                }
            }
        }
    }
}

fn dispatch_inbound(shared: &Shared, text: &str) {
    let message: WireMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("[conn] Dropping undecodable frame: {}", e);
            return;
        }
    };
    if message.kind == WireKind::Heartbeat {
        debug!("[conn] heartbeat ack");
        return;
    }
    // No receivers is fine: nobody is routing yet.
    let _ = shared.inbound.send(message);
}

// ── Production connector ───────────────────────────────────────────────────

/// `SocketConnector` over tokio-tungstenite.
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn open(&self, url: &str) -> SyncResult<(FrameSink, FrameStream)> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();

        let sink: FrameSink = Box::pin(
            write
                .sink_map_err(SyncError::from)
                .with(|text: String| future::ready(Ok::<_, SyncError>(WsMessage::Text(text)))),
        );

        let stream: FrameStream = Box::pin(read.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Ok(WsMessage::Close(frame)) => {
                    let reason = frame.map(|f| format!("{} {}", u16::from(f.code), f.reason)).unwrap_or_default();
                    Some(Err(SyncError::socket(format!("closed by peer {}", reason).trim_end())))
                }
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::from(e))),
            })
        }));

        Ok((sink, stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{Token, UserId};
    use crate::engine::credentials::StaticCredentials;
    use crate::engine::testing::MockConnector;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            url: "ws://chat.test/ws".into(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 3,
        }
    }

    fn creds() -> Arc<StaticCredentials> {
        Arc::new(StaticCredentials::new(Some(Token::new("tok")), Some(UserId::new("u1"))))
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    #[test]
    fn transitions() {
        use ConnectionEvent as E;
        use ConnectionState as S;
        assert_eq!(S::Disconnected.on(E::Connect), S::Connecting);
        assert_eq!(S::Connecting.on(E::Opened), S::Connected);
        assert_eq!(S::Connected.on(E::HeartbeatTimeout), S::Reconnecting);
        assert_eq!(S::Connected.on(E::Closed), S::Reconnecting);
        assert_eq!(S::Reconnecting.on(E::Opened), S::Connected);
        assert_eq!(S::Reconnecting.on(E::Exhausted), S::Failed);
        assert_eq!(S::Failed.on(E::Opened), S::Failed);
        assert_eq!(S::Failed.on(E::Connect), S::Connecting);
        assert_eq!(S::Connected.on(E::Disconnect), S::Disconnected);
        assert_eq!(S::Connected.on(E::Connect), S::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_token_and_sends_initial_heartbeat() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector);
        let mut states = mgr.connect();

        let mut socket = server.recv().await.unwrap();
        assert_eq!(socket.url, "ws://chat.test/ws?token=tok");
        wait_state(&mut states, ConnectionState::Connected).await;

        let first: WireMessage = serde_json::from_str(&socket.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind, WireKind::Heartbeat);
    }

    #[tokio::test(start_paused = true)]
    async fn close_then_reconnect() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector);
        let mut states = mgr.connect();

        let socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;
        socket.close();
        wait_state(&mut states, ConnectionState::Reconnecting).await;

        let _second = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_socket_goes_stale() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector);
        let mut states = mgr.connect();

        let _socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;
        let connected_at = Instant::now();
        wait_state(&mut states, ConnectionState::Reconnecting).await;
        assert!(connected_at.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_socket_alive() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector);
        let mut states = mgr.connect();

        let socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(25)).await;
            socket.push(r#"{"type":"heartbeat","payload":{},"timestamp":1}"#);
        }
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_stops_retrying_until_connect() {
        let (connector, mut server) = MockConnector::new();
        connector.refuse(true);
        let mgr = ConnectionManager::new(settings(), creds(), connector.clone());
        let mut states = mgr.connect();

        wait_state(&mut states, ConnectionState::Failed).await;
        assert_eq!(connector.attempts(), 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 3);

        connector.refuse(false);
        let mut states = mgr.connect();
        let _socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_connected() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector);
        let msg = WireMessage::new(WireKind::Typing, serde_json::json!({"isTyping": true}), 1);
        assert!(matches!(mgr.send(&msg).await, Err(SyncError::NotConnected)));

        let mut states = mgr.connect();
        let mut socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;
        let _heartbeat = socket.recv().await.unwrap();

        mgr.send(&msg).await.unwrap();
        let got: WireMessage = serde_json::from_str(&socket.recv().await.unwrap()).unwrap();
        assert_eq!(got.kind, WireKind::Typing);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_skips_heartbeats() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector);
        let mut inbound = mgr.inbound();
        let mut states = mgr.connect();
        let socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;

        socket.push(r#"{"type":"heartbeat","payload":{},"timestamp":1}"#);
        socket.push("not json");
        socket.push(r#"{"type":"system","payload":{"text":"hello"},"timestamp":2}"#);
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.kind, WireKind::System);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let (connector, mut server) = MockConnector::new();
        let mgr = ConnectionManager::new(settings(), creds(), connector.clone());
        let mut states = mgr.connect();
        let _socket = server.recv().await.unwrap();
        wait_state(&mut states, ConnectionState::Connected).await;

        mgr.disconnect();
        mgr.disconnect();
        assert_eq!(mgr.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_counts_as_failure() {
        let (connector, _server) = MockConnector::new();
        let creds = Arc::new(StaticCredentials::signed_out());
        let mgr = ConnectionManager::new(settings(), creds, connector.clone());
        let mut states = mgr.connect();
        wait_state(&mut states, ConnectionState::Failed).await;
        assert_eq!(connector.attempts(), 0);
    }
}
