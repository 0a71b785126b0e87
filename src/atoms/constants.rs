// ── Cziczere Atoms: Constants ──────────────────────────────────────────────
// All named defaults for the crate live here. `SyncConfig` starts from these
// and lets TOML / env override them.

// ── Bidirectional channel ─────────────────────────────────────────────────
// Heartbeat is sent every interval while Connected. Two intervals without any
// inbound frame means the socket is stale and gets force-closed.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/chat";
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const HEARTBEAT_STALE_FACTOR: u32 = 2;

// Fixed delay between reconnect attempts; the attempt counter resets on every
// successful open.
pub const RECONNECT_INTERVAL_MS: u64 = 3_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Capacity of the outbound frame queue of one open socket.
pub(crate) const OUTBOUND_QUEUE_CAPACITY: usize = 64;
/// Capacity of the inbound wire-message fan-out.
pub(crate) const INBOUND_BROADCAST_CAPACITY: usize = 256;

// ── Message correlator ────────────────────────────────────────────────────
pub const MESSAGE_TIMEOUT_MS: u64 = 30_000;
pub const SWEEP_INTERVAL_MS: u64 = 5_000;

// ── Optimistic writes ─────────────────────────────────────────────────────
pub const OPTIMISTIC_GRACE_MS: u64 = 30_000;
/// Failed drafts leave the tracker ledger this long after their deadline.
/// They stay visible in the store; a late record echoing the nonce still heals them.
pub const FAILED_WRITE_RETENTION_MS: u64 = 10 * 60_000;

// ── Store bounds ──────────────────────────────────────────────────────────
pub const MAX_MEMORIES: usize = 100;
pub const INSIGHT_RING_SIZE: usize = 10;
pub const MAX_CONVERSATION_HISTORY: usize = 50;

// ── Outbound conversation context excerpt ─────────────────────────────────
// Keeps `message` payloads small: most recent memories and chat turns only.
pub const CONTEXT_RECENT_MEMORIES: usize = 5;
pub const CONTEXT_RECENT_TURNS: usize = 10;

// ── Atmosphere cache ──────────────────────────────────────────────────────
pub const ATMOSPHERE_TTL_SECS: i64 = 5 * 60;

// ── Push feed ─────────────────────────────────────────────────────────────
pub const DEFAULT_FEED_URL: &str = "http://127.0.0.1:8085/feeds";
pub(crate) const FEED_EVENT_CAPACITY: usize = 256;

// ── One-shot calls ────────────────────────────────────────────────────────
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:5001/cziczere-ai/us-central1";
pub const MAX_REQUESTS_PER_MINUTE: u32 = 60;
pub const MAX_REQUESTS_PER_HOUR: u32 = 1_000;
/// Response-time samples kept by the call metrics ring.
pub(crate) const CALL_METRICS_CAPACITY: usize = 100;

// ── Emotions tracked by the trend selector ────────────────────────────────
pub const TRACKED_EMOTIONS: [&str; 5] = ["joy", "sadness", "anger", "fear", "surprise"];
